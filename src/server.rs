use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::backend::health::HealthMonitor;
use crate::bail_relay;
use crate::error::{RelayError, RelayResult};
use crate::pipeline::{InferencePipeline, Stage};

/// Shared handles behind every request handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<InferencePipeline>,
    pub monitor: Arc<dyn HealthMonitor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/inference/:model", post(handle_inference_request))
        // The receiver enforces the upload cap itself so oversized uploads
        // get a structured 413 instead of axum's stock rejection.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    inference: BackendStatus,
    visualization: ReachabilityStatus,
}

#[derive(Serialize)]
struct BackendStatus {
    live: bool,
    ready: bool,
}

/// The visualization engine has no health routes, only a root route, so its
/// report is reachability rather than readiness.
#[derive(Serialize)]
struct ReachabilityStatus {
    reachable: bool,
}

#[axum_macros::debug_handler]
async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (live, ready, reachable) = tokio::join!(
        state.monitor.is_live(),
        state.monitor.is_ready(),
        state.pipeline.visualization_reachable(),
    );
    Json(StatusResponse {
        status: if live && ready && reachable {
            "ok"
        } else {
            "degraded"
        },
        inference: BackendStatus { live, ready },
        visualization: ReachabilityStatus { reachable },
    })
}

/// Runs the full pipeline and streams the visualization back.
///
/// Failures before the first body byte map onto their HTTP status. Once
/// streaming has begun the status line is out; an upstream break then aborts
/// the connection instead, so a caller never mistakes a truncated body for a
/// complete one.
#[axum_macros::debug_handler]
async fn handle_inference_request(
    State(state): State<AppState>,
    Path(model): Path<String>,
    multipart: Multipart,
) -> RelayResult<Response> {
    if !valid_model_name(&model) {
        bail_relay!(StatusCode::BAD_REQUEST, "Invalid model name {:?}", model);
    }

    match state.pipeline.execute(&model, multipart).await {
        Ok(visualization) => {
            let mut response = Body::from_stream(visualization.stream).into_response();
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_str(&visualization.content_type)
                    .unwrap_or(HeaderValue::from_static("application/octet-stream")),
            );
            Ok(response)
        }
        Err(err) => {
            warn!(stage = %Stage::Failed, %model, %err, "inference request failed");
            Err(RelayError::from_pipeline(err))
        }
    }
}

/// Model names end up in backend health routes, so only plain names pass.
/// At least one alphanumeric is required; "." and ".." would otherwise pass
/// and turn into path traversal once URL-normalized.
fn valid_model_name(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_model_names_pass() {
        assert!(valid_model_name("yolov4"));
        assert!(valid_model_name("detector-v2.1_full"));
    }

    #[test]
    fn path_shaped_model_names_are_rejected() {
        assert!(!valid_model_name(""));
        assert!(!valid_model_name("a/b"));
        assert!(!valid_model_name("model name"));
        assert!(!valid_model_name("../escape"));
    }

    #[test]
    fn dot_only_model_names_are_rejected() {
        assert!(!valid_model_name("."));
        assert!(!valid_model_name(".."));
        assert!(!valid_model_name("-_."));
    }
}
