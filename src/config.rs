use std::path::PathBuf;

use anyhow::Result;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

/// Media types accepted when no allow list is configured, comma separated so
/// the same value works for the CLI flag, the environment and the TOML file.
pub const DEFAULT_ALLOWED_CONTENT_TYPES: &str = "image/jpeg,image/png,video/mp4,video/x-m4v,\
    video/x-matroska,video/webm,audio/mp4,audio/mpeg,audio/midi,audio/aac,audio/x-wav";

#[derive(ClapSerde, Deserialize, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub address: String,

    /// The port the listener binds to
    #[arg(short, long, env, default_value = "8500")]
    pub port: u16,

    /// Base URL of the inference backend
    #[arg(long, env, default_value = "http://localhost:5001")]
    pub inference_url: String,

    /// Base URL of the visualization backend
    #[arg(long, env, default_value = "http://localhost:5002")]
    pub visualization_url: String,

    /// Upper bound in bytes for a complete multipart upload
    #[arg(long, env, default_value = "104857600")]
    pub max_upload_bytes: u64,

    /// Comma separated media types accepted for the media form field
    #[arg(long, env, default_value = DEFAULT_ALLOWED_CONTENT_TYPES)]
    pub allowed_content_types: String,

    /// Directory uploads are staged in, defaults to the system temp directory
    #[arg(long, env)]
    pub staging_dir: Option<PathBuf>,

    /// Seconds before a backend connection attempt is abandoned
    #[arg(long, env, default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Seconds before a pending inference request is abandoned
    #[arg(long, env, default_value = "300")]
    pub request_timeout_secs: u64,

    /// Seconds between cached health refreshes, 0 probes on every request
    #[arg(long, env, default_value = "0")]
    pub health_refresh_secs: u64,

    /// OTLP endpoint traces and metrics are exported to
    #[arg(long, env)]
    pub otlp_endpoint: Option<String>,

    /// Also write spans to stdout when telemetry export is enabled
    #[arg(long, env)]
    pub console: bool,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The configured allow list as individual media types.
    pub fn allowed_media_types(&self) -> Vec<String> {
        self.allowed_content_types
            .split(',')
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}
