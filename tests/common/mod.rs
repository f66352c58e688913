use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::async_trait;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures_util::StreamExt;
use tempfile::TempDir;
use url::Url;

use inference_relay::backend::endpoint::BackendEndpoint;
use inference_relay::backend::health::HealthMonitor;
use inference_relay::pipeline::{InferencePipeline, PipelineSettings};
use inference_relay::server::{router, AppState};

/// Leading bytes that sniff as image/png.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR-test-payload";
/// Leading bytes that sniff as image/jpeg.
pub const JPEG_BYTES: &[u8] = b"\xff\xd8\xff\xe0\x00\x10JFIF\x00-test-payload";

/// Monitor with fixed answers, for driving the dispatch gate from tests.
pub struct StaticMonitor {
    pub live: bool,
    pub ready: bool,
    pub model_ready: bool,
}

#[async_trait]
impl HealthMonitor for StaticMonitor {
    async fn is_live(&self) -> bool {
        self.live
    }

    async fn is_ready(&self) -> bool {
        self.ready
    }

    async fn is_model_ready(&self, _model: &str) -> bool {
        self.model_ready
    }
}

pub fn healthy() -> Arc<StaticMonitor> {
    Arc::new(StaticMonitor {
        live: true,
        ready: true,
        model_ready: true,
    })
}

/// One multipart field as a mock backend received it.
#[derive(Clone)]
pub struct SeenField {
    pub name: String,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Default, Clone)]
pub struct SeenUpload {
    pub fields: Vec<SeenField>,
}

/// Canned answer a mock backend gives to every request.
pub enum MockReply {
    Bytes {
        status: StatusCode,
        content_type: &'static str,
        body: Vec<u8>,
    },
    /// Sends a 200 and some body bytes, then breaks the stream.
    Truncated {
        content_type: &'static str,
        head: Vec<u8>,
    },
}

#[derive(Clone)]
struct MockState {
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Option<SeenUpload>>>,
    reply: Arc<MockReply>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Option<SeenUpload>>>,
}

impl MockBackend {
    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn seen_field(&self, name: &str) -> SeenField {
        self.seen
            .lock()
            .unwrap()
            .clone()
            .expect("backend saw no request")
            .fields
            .into_iter()
            .find(|field| field.name == name)
            .unwrap_or_else(|| panic!("backend did not receive field {name:?}"))
    }
}

/// An address nothing listens on, for driving unreachable-backend paths.
pub async fn vacant_backend() -> MockBackend {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    MockBackend {
        addr,
        hits: Arc::new(AtomicUsize::new(0)),
        seen: Arc::new(Mutex::new(None)),
    }
}

pub async fn spawn_backend(path: &'static str, reply: MockReply) -> MockBackend {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));
    let state = MockState {
        hits: hits.clone(),
        seen: seen.clone(),
        reply: Arc::new(reply),
    };
    let app = Router::new()
        .route(path, post(mock_handler))
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockBackend { addr, hits, seen }
}

async fn mock_handler(State(state): State<MockState>, mut multipart: Multipart) -> Response {
    let mut upload = SeenUpload::default();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_owned);
        let file_name = field.file_name().map(str::to_owned);
        let bytes = field.bytes().await.unwrap().to_vec();
        upload.fields.push(SeenField {
            name,
            content_type,
            file_name,
            bytes,
        });
    }
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.seen.lock().unwrap() = Some(upload);

    match state.reply.as_ref() {
        MockReply::Bytes {
            status,
            content_type,
            body,
        } => (
            *status,
            [(header::CONTENT_TYPE, *content_type)],
            body.clone(),
        )
            .into_response(),
        MockReply::Truncated { content_type, head } => {
            let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
                Ok(bytes::Bytes::from(head.clone())),
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "render failed",
                )),
            ];
            // The break comes after a gap, not back-to-back with the head.
            // An immediate error can reset the connection before the relay
            // has read the response head, which turns the mid-stream abort
            // under test into a plain 502.
            let stream = futures_util::stream::iter(chunks).then(|chunk| async move {
                if chunk.is_err() {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                chunk
            });
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, *content_type)],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

/// A relay instance listening on an ephemeral port, staging into its own
/// temp directory so cleanup is observable.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub staging: TempDir,
    pub client: reqwest::Client,
}

pub async fn spawn_relay(
    inference: &MockBackend,
    visualization: &MockBackend,
    monitor: Arc<dyn HealthMonitor>,
    max_upload_bytes: u64,
    allowed: &[&str],
) -> TestRelay {
    let staging = TempDir::new().unwrap();
    let client = reqwest::Client::new();

    let pipeline = InferencePipeline::new(
        client.clone(),
        BackendEndpoint::new("inference", inference.base_url())
            .with_response_content_type("application/json"),
        BackendEndpoint::new("visualization", visualization.base_url()),
        monitor.clone(),
        PipelineSettings {
            max_upload_bytes,
            allowed_content_types: allowed.iter().map(|t| t.to_string()).collect(),
            staging_dir: Some(staging.path().to_path_buf()),
            request_timeout: Duration::from_secs(5),
        },
    );
    let app = router(AppState {
        pipeline: Arc::new(pipeline),
        monitor,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestRelay {
        addr,
        staging,
        client,
    }
}

impl TestRelay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn post_upload(&self, model: &str, form: reqwest::multipart::Form) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/inference/{model}")))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.staging.path()).unwrap().count()
    }

    /// Cleanup runs when the response stream drops, which can land a moment
    /// after the client sees the end of the body.
    pub async fn assert_staging_drained(&self) {
        for _ in 0..50 {
            if self.staged_files() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "staged files were not cleaned up: {} left",
            self.staged_files()
        );
    }
}

pub fn media_form(bytes: &[u8], declared: &str, file_name: &str) -> reqwest::multipart::Form {
    reqwest::multipart::Form::new().part(
        "media",
        reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(declared)
            .unwrap(),
    )
}

pub fn json_ok(body: serde_json::Value) -> MockReply {
    MockReply::Bytes {
        status: StatusCode::OK,
        content_type: "application/json",
        body: serde_json::to_vec(&body).unwrap(),
    }
}
