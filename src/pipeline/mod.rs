use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Multipart;
use reqwest::multipart::Part;
use reqwest::Client;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::backend::endpoint::BackendEndpoint;
use crate::backend::health::HealthMonitor;
use crate::error::PipelineError;

pub mod dispatcher;
pub mod receiver;
pub mod relay;
pub mod staging;

use dispatcher::StageDispatcher;
use receiver::{StagedUpload, UploadReceiver};
use relay::{RelayedVisualization, ResultRelay};
use staging::StagedMedia;

/// Lifecycle of one request, recorded on log events as `stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Staged,
    Dispatched,
    ResultReady,
    Relaying,
    Complete,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Staged => "staged",
            Stage::Dispatched => "dispatched",
            Stage::ResultReady => "result_ready",
            Stage::Relaying => "relaying",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Upload handling knobs, read from the configuration at startup.
pub struct PipelineSettings {
    pub max_upload_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub staging_dir: Option<PathBuf>,
    pub request_timeout: Duration,
}

/// The whole receive, dispatch and relay chain of one deployment. Every
/// collaborator is handed in at construction; nothing lives in globals.
pub struct InferencePipeline {
    receiver: UploadReceiver,
    dispatcher: StageDispatcher,
    relay: ResultRelay,
}

impl InferencePipeline {
    pub fn new(
        client: Client,
        inference: BackendEndpoint,
        visualization: BackendEndpoint,
        monitor: Arc<dyn HealthMonitor>,
        settings: PipelineSettings,
    ) -> Self {
        InferencePipeline {
            receiver: UploadReceiver::new(
                settings.max_upload_bytes,
                settings.allowed_content_types,
                settings.staging_dir,
            ),
            dispatcher: StageDispatcher::new(
                client.clone(),
                inference,
                monitor,
                settings.request_timeout,
            ),
            relay: ResultRelay::new(client, visualization),
        }
    }

    /// Runs one request through all stages.
    ///
    /// The returned stream owns the staged file. Dropping it at any point,
    /// for instance because the caller went away, cancels whatever is left
    /// of the chain and removes the file.
    #[tracing::instrument(level = "info", skip(self, multipart))]
    pub async fn execute(
        &self,
        model: &str,
        multipart: Multipart,
    ) -> Result<RelayedVisualization, PipelineError> {
        debug!(stage = %Stage::Received, "handling inference request");
        let StagedUpload { media, text } = self.receiver.receive(multipart).await?;
        let media = media.ok_or(PipelineError::EmptyUpload)?;

        let result = self
            .dispatcher
            .dispatch(model, &media, text.as_ref())
            .await?;
        debug!(stage = %Stage::ResultReady, "inference result decoded");

        self.relay.relay(media, &result).await
    }

    /// Reachability of the visualization leg for the status report. The
    /// dispatch gate only covers the inference leg; this is the other half.
    pub async fn visualization_reachable(&self) -> bool {
        self.relay.backend_reachable().await
    }
}

/// Builds the streaming file part for a downstream send. Opening a fresh
/// handle per send means every send starts at the first byte, however many
/// backends the staged file has already been sent to.
pub(crate) async fn streamed_media_part(
    media: &StagedMedia,
    backend: &'static str,
) -> Result<Part, PipelineError> {
    let file = media.reopen().await?;
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    let mut part = Part::stream_with_length(body, media.len())
        .mime_str(media.content_type())
        .map_err(|source| PipelineError::UpstreamTransport { backend, source })?;
    if let Some(name) = media.file_name() {
        part = part.file_name(name.to_owned());
    }
    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_stable_log_values() {
        assert_eq!(Stage::Received.to_string(), "received");
        assert_eq!(Stage::ResultReady.to_string(), "result_ready");
        assert_eq!(Stage::Failed.to_string(), "failed");
    }
}
