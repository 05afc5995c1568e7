//! HTTP server for agrid

use crate::context::CallContext;
use crate::decision::DecisionComposer;
use crate::ingest::{CollectorHandle, IngestQueue, SensorContextStore};
use crate::knowledge::KnowledgeService;
use crate::metrics::{Observer, PrometheusObserver};
use crate::routes;
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers
pub struct AppState {
    pub composer: Arc<DecisionComposer>,
    pub knowledge: Arc<KnowledgeService>,
    pub sensors: Arc<SensorContextStore>,
    /// None when the daemon runs without a message bus
    pub collector: Option<CollectorHandle>,
    /// Readings posted over HTTP join the bus readings here when set
    pub ingest: Option<IngestQueue>,
    pub observer: Arc<dyn Observer>,
    pub metrics: Option<Arc<PrometheusObserver>>,
    pub request_timeout: Duration,
    /// Root token; every request context is a child of it
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        composer: Arc<DecisionComposer>,
        knowledge: Arc<KnowledgeService>,
        sensors: Arc<SensorContextStore>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            composer,
            knowledge,
            sensors,
            collector: None,
            ingest: None,
            observer,
            metrics: None,
            request_timeout: Duration::from_secs(120),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    pub fn with_collector(mut self, collector: CollectorHandle) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_ingest_queue(mut self, queue: IngestQueue) -> Self {
        self.ingest = Some(queue);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusObserver>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Per-request context: cancelled on shutdown, bounded by the request deadline
    pub fn request_context(&self) -> CallContext {
        CallContext::with_token(self.shutdown.child_token()).with_timeout(self.request_timeout)
    }
}

/// Assemble the router with all routes and layers
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::decision_routes())
        .merge(routes::knowledge_routes())
        .merge(routes::sensor_routes())
        .merge(routes::metrics_routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            routes::track_requests,
        ))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until the state's shutdown token is cancelled
pub async fn run(state: AppState, addr: SocketAddr) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("  Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")?;

    info!("  HTTP server stopped");
    Ok(())
}
