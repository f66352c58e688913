use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use reqwest::multipart::Form;
use reqwest::Client;
use tracing::debug;

use crate::backend::endpoint::BackendEndpoint;
use crate::backend::health::HealthMonitor;
use crate::error::PipelineError;
use crate::pipeline::receiver::{TextPayload, MEDIA_FIELD, TEXT_FIELD};
use crate::pipeline::staging::StagedMedia;
use crate::pipeline::{streamed_media_part, Stage};

/// Decoded answer of the inference backend.
#[derive(Debug)]
pub struct InferenceResult {
    pub payload: serde_json::Value,
    pub content_type: Option<String>,
}

/// Sends staged uploads to the inference backend and decodes its answer.
pub struct StageDispatcher {
    client: Client,
    endpoint: BackendEndpoint,
    monitor: Arc<dyn HealthMonitor>,
    request_timeout: Duration,
}

impl StageDispatcher {
    pub fn new(
        client: Client,
        endpoint: BackendEndpoint,
        monitor: Arc<dyn HealthMonitor>,
        request_timeout: Duration,
    ) -> Self {
        StageDispatcher {
            client,
            endpoint,
            monitor,
            request_timeout,
        }
    }

    /// The backend must be live, ready and serving the requested model before
    /// any bytes leave the relay.
    async fn backend_can_serve(&self, model: &str) -> bool {
        self.monitor.is_live().await
            && self.monitor.is_ready().await
            && self.monitor.is_model_ready(model).await
    }

    #[tracing::instrument(level = "info", skip(self, media, text))]
    pub async fn dispatch(
        &self,
        model: &str,
        media: &StagedMedia,
        text: Option<&TextPayload>,
    ) -> Result<InferenceResult, PipelineError> {
        if !self.backend_can_serve(model).await {
            return Err(PipelineError::BackendUnavailable {
                backend: self.endpoint.name(),
            });
        }

        let mut form = Form::new().part(
            MEDIA_FIELD,
            streamed_media_part(media, self.endpoint.name()).await?,
        );
        if let Some(text) = text {
            form = form.text(TEXT_FIELD, text.raw.clone());
        }

        debug!(stage = %Stage::Dispatched, bytes = media.len(), "forwarding staged upload");
        let response = self
            .client
            .post(self.endpoint.route("predict"))
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| PipelineError::UpstreamTransport {
                backend: self.endpoint.name(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::UpstreamRejected {
                backend: self.endpoint.name(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if let (Some(expected), Some(actual)) =
            (self.endpoint.response_content_type(), content_type.as_deref())
        {
            if !actual.starts_with(expected) {
                debug!(
                    expected,
                    actual, "inference backend answered with an unexpected content type"
                );
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| PipelineError::UpstreamTransport {
                backend: self.endpoint.name(),
                source,
            })?;
        let payload =
            serde_json::from_slice(&body).map_err(|source| PipelineError::UpstreamDecode {
                backend: self.endpoint.name(),
                source,
            })?;
        Ok(InferenceResult {
            payload,
            content_type,
        })
    }
}
