use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::header::CONTENT_TYPE;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::Form;
use reqwest::Client;
use tracing::{debug, error};

use crate::backend::endpoint::BackendEndpoint;
use crate::backend::health::PROBE_TIMEOUT;
use crate::error::PipelineError;
use crate::pipeline::dispatcher::InferenceResult;
use crate::pipeline::staging::StagedMedia;
use crate::pipeline::{streamed_media_part, Stage};

/// Form field carrying the original media on the way to visualization.
const INPUTS_FIELD: &str = "inputs";
/// Form field carrying the serialized inference result.
const OUTPUTS_FIELD: &str = "outputs";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// The visualization answer on its way back to the caller: the content type
/// for the response head, the byte stream for the body.
pub struct RelayedVisualization {
    pub content_type: String,
    pub stream: VisualizationStream,
}

/// Body stream of the relayed visualization.
///
/// Owns the staged media so the temp file outlives the last byte sent,
/// wherever the stream ends up being dropped. An upstream failure surfaces
/// as an `Err` item, which aborts the connection mid-body; the status line
/// is long gone at that point.
pub struct VisualizationStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send>>,
    _staged: StagedMedia,
    finished: bool,
}

impl Stream for VisualizationStream {
    type Item = Result<Bytes, PipelineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        if matches!(polled, Poll::Ready(None)) && !this.finished {
            this.finished = true;
            debug!(stage = %Stage::Complete, "visualization stream finished");
        }
        polled
    }
}

/// Sends the original media plus the inference result to the visualization
/// backend and hands its streamed answer back.
pub struct ResultRelay {
    client: Client,
    endpoint: BackendEndpoint,
}

impl ResultRelay {
    pub fn new(client: Client, endpoint: BackendEndpoint) -> Self {
        ResultRelay { client, endpoint }
    }

    /// Whether the backend answers HTTP at all, probed at its root route.
    /// Any response counts; only transport failures report down.
    pub async fn backend_reachable(&self) -> bool {
        self.client
            .get(self.endpoint.route(""))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    /// Takes ownership of the staged media: the temp file moves into the
    /// returned stream and is removed once that stream is dropped. On any
    /// error the media is dropped right here instead.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn relay(
        &self,
        media: StagedMedia,
        result: &InferenceResult,
    ) -> Result<RelayedVisualization, PipelineError> {
        let outputs =
            serde_json::to_string(&result.payload).map_err(PipelineError::ResultEncode)?;
        let form = Form::new()
            .part(
                INPUTS_FIELD,
                streamed_media_part(&media, self.endpoint.name()).await?,
            )
            .text(OUTPUTS_FIELD, outputs);

        let response = self
            .client
            .post(self.endpoint.route("visualize"))
            .multipart(form)
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
            .map(str::to_owned)
            .or_else(|| self.endpoint.response_content_type().map(str::to_owned))
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

        debug!(stage = %Stage::Relaying, %content_type, "forwarding visualization stream");
        let backend = self.endpoint.name();
        let inner = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|source| {
                error!(backend, %source, "visualization stream broke mid-body");
                PipelineError::StreamTruncated { backend, source }
            })
        });

        Ok(RelayedVisualization {
            content_type,
            stream: VisualizationStream {
                inner: Box::pin(inner),
                _staged: media,
                finished: false,
            },
        })
    }
}
