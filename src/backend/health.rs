use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::endpoint::BackendEndpoint;

/// Budget for one probe round trip. Probes run on the request path when no
/// refresh interval is configured, so a backend that accepts and then hangs
/// must not stall the dispatch gate.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Answers whether a backend can take work right now.
///
/// The dispatcher requires all three predicates to hold before sending
/// anything. Answers are point-in-time and may be stale by the time the
/// request lands on the backend.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn is_live(&self) -> bool;
    async fn is_ready(&self) -> bool;
    async fn is_model_ready(&self, model: &str) -> bool;
}

/// Probes the KServe-style health routes of the backend on every call.
pub struct HttpHealthMonitor {
    client: Client,
    endpoint: BackendEndpoint,
}

impl HttpHealthMonitor {
    pub fn new(client: Client, endpoint: BackendEndpoint) -> Self {
        HttpHealthMonitor { client, endpoint }
    }

    async fn probe(&self, route: &str) -> bool {
        let url = self.endpoint.route(route);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(backend = self.endpoint.name(), %err, "health probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl HealthMonitor for HttpHealthMonitor {
    async fn is_live(&self) -> bool {
        self.probe("v2/health/live").await
    }

    async fn is_ready(&self) -> bool {
        self.probe("v2/health/ready").await
    }

    async fn is_model_ready(&self, model: &str) -> bool {
        self.probe(&format!("v2/models/{model}/ready")).await
    }
}

/// Serves liveness and readiness from flags a background task refreshes, so
/// request handling never waits on a probe. Model readiness depends on the
/// requested name and is always delegated.
///
/// Flags start out pessimistic and flip once the first refresh lands.
pub struct CachedHealthMonitor {
    inner: Arc<dyn HealthMonitor>,
    live: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    refresher: JoinHandle<()>,
}

impl CachedHealthMonitor {
    pub fn spawn(inner: Arc<dyn HealthMonitor>, interval: Duration) -> Self {
        let live = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicBool::new(false));
        let refresher = tokio::spawn({
            let inner = inner.clone();
            let live = live.clone();
            let ready = ready.clone();
            async move {
                loop {
                    live.store(inner.is_live().await, Ordering::Relaxed);
                    ready.store(inner.is_ready().await, Ordering::Relaxed);
                    tokio::time::sleep(interval).await;
                }
            }
        });
        CachedHealthMonitor {
            inner,
            live,
            ready,
            refresher,
        }
    }
}

impl Drop for CachedHealthMonitor {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

#[async_trait]
impl HealthMonitor for CachedHealthMonitor {
    async fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn is_model_ready(&self, model: &str) -> bool {
        self.inner.is_model_ready(model).await
    }
}
