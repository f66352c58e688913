use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct RelayError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl<E> From<E> for RelayError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        RelayError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: HttpErrorResponse::from(err.into().to_string()),
        }
    }
}

impl RelayError {
    /// Maps a pipeline failure onto its HTTP status, keeping the display
    /// message as the response body.
    pub fn from_pipeline(err: PipelineError) -> Self {
        RelayError {
            status: err.status(),
            message: HttpErrorResponse::from(err.to_string()),
        }
    }
}

pub type RelayResult<T, E = RelayError> = Result<T, E>;

#[macro_export]
macro_rules! bail_relay {
    ($status:expr, $message:expr) => {
        return Err($crate::error::RelayError {
            status: $status,
            message: $crate::error::HttpErrorResponse::from($message),
        })
    };
    ($status:expr, $fmt:expr $(, $arg:expr)+) => {
        return Err($crate::error::RelayError {
            status: $status,
            message: $crate::error::HttpErrorResponse::from(format!($fmt $(, $arg)+)),
        })
    };
}

/// Everything that can go wrong between accepting an upload and handing the
/// visualization stream back to the caller.
///
/// Client-side faults map to 4xx, backend faults to 502/503. `StreamTruncated`
/// is special: it occurs after the response status has already been sent and
/// only ever travels through the response body stream.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upload exceeds the configured limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("media type {} is not accepted", .detected.as_deref().unwrap_or("of the uploaded bytes"))]
    UnsupportedMediaType { detected: Option<String> },

    #[error("request contains no media upload")]
    EmptyUpload,

    #[error("unexpected form field {0:?}")]
    UnknownField(String),

    #[error("form field {0:?} appears more than once")]
    DuplicateField(&'static str),

    #[error("text field is not valid UTF-8")]
    TextNotUtf8,

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("unable to reach the {backend} backend or its model is not ready")]
    BackendUnavailable { backend: &'static str },

    #[error("{backend} backend rejected the request with status {status}")]
    UpstreamRejected {
        backend: &'static str,
        status: StatusCode,
    },

    #[error("{backend} backend returned a malformed result: {source}")]
    UpstreamDecode {
        backend: &'static str,
        source: serde_json::Error,
    },

    #[error("request to the {backend} backend failed: {source}")]
    UpstreamTransport {
        backend: &'static str,
        source: reqwest::Error,
    },

    #[error("{backend} stream ended before completion: {source}")]
    StreamTruncated {
        backend: &'static str,
        source: reqwest::Error,
    },

    #[error("inference result could not be re-encoded: {0}")]
    ResultEncode(serde_json::Error),

    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PipelineError::EmptyUpload
            | PipelineError::UnknownField(_)
            | PipelineError::DuplicateField(_)
            | PipelineError::TextNotUtf8
            | PipelineError::Multipart(_) => StatusCode::BAD_REQUEST,
            PipelineError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::UpstreamRejected { .. }
            | PipelineError::UpstreamDecode { .. }
            | PipelineError::UpstreamTransport { .. }
            | PipelineError::StreamTruncated { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::ResultEncode(_) | PipelineError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
