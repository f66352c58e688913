use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{error, info};
use url::Url;

use inference_relay::backend::endpoint::BackendEndpoint;
use inference_relay::backend::health::{CachedHealthMonitor, HealthMonitor, HttpHealthMonitor};
use inference_relay::config::Config;
use inference_relay::pipeline::{InferencePipeline, PipelineSettings};
use inference_relay::server::{router, AppState};
use inference_relay::telemetry::init_telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "InferenceRelay.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                exit_err!(
                    1,
                    "Failed to read configuration file {} with error: {}",
                    args.config_file,
                    err
                );
            }
        }
    };
    init_telemetry(config.otlp_endpoint.as_deref(), config.console)?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()?;

    let inference = BackendEndpoint::new(
        "inference",
        Url::parse(&config.inference_url).context("Invalid inference backend URL")?,
    )
    .with_response_content_type("application/json");
    let visualization = BackendEndpoint::new(
        "visualization",
        Url::parse(&config.visualization_url).context("Invalid visualization backend URL")?,
    );

    let probe = Arc::new(HttpHealthMonitor::new(client.clone(), inference.clone()));
    let monitor: Arc<dyn HealthMonitor> = if config.health_refresh_secs > 0 {
        Arc::new(CachedHealthMonitor::spawn(
            probe,
            Duration::from_secs(config.health_refresh_secs),
        ))
    } else {
        probe
    };

    let pipeline = InferencePipeline::new(
        client,
        inference,
        visualization,
        monitor.clone(),
        PipelineSettings {
            max_upload_bytes: config.max_upload_bytes,
            allowed_content_types: config.allowed_media_types(),
            staging_dir: config.staging_dir.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        },
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
        monitor,
    };

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

// TODO set a timeout so open streams cannot hold the shutdown forever
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

// Telemetry is not up yet when configuration loading fails, so this writes
// straight to stderr instead of a tracing macro.
#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {{
        eprintln!($fmt $(, $arg)*);
        std::process::exit($code);
    }};
}
