//! API routes for agrid

use crate::ingest::stamp_reading;
use crate::knowledge::NewDocument;
use crate::server::AppState;
use agri_common::{AgriError, DecisionResult, ErrorKind, Payload, SensorReading};
use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, MatchedPath, Path, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

type AppStateArc = Arc<AppState>;

// ============================================================================
// Errors
// ============================================================================

/// Failure returned by a handler, rendered as `{"error": {"kind", "message"}}`
#[derive(Debug)]
pub enum ApiError {
    Agri(AgriError),
    NotFound(String),
    PayloadTooLarge(String),
    Unavailable(String),
    Internal(String),
}

impl From<AgriError> for ApiError {
    fn from(err: AgriError) -> Self {
        ApiError::Agri(err)
    }
}

/// Undecodable bodies are validation failures; oversized ones keep their 413
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(rejection.body_text())
        } else {
            ApiError::Agri(AgriError::validation(rejection.body_text()))
        }
    }
}

/// `Json` extractor whose rejections render as `ApiError`
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// HTTP status for a core error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::DeserializationError => StatusCode::BAD_REQUEST,
        ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::CancellationError => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Agri(err) => {
                let kind = err.kind();
                (status_for(kind), kind.as_str(), err.to_string())
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::PayloadTooLarge(message) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
            }
            ApiError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };

        if status.is_server_error() {
            error!("  Request failed ({}): {}", kind, message);
        } else {
            warn!("  Request rejected ({}): {}", kind, message);
        }

        (
            status,
            Json(json!({ "error": { "kind": kind, "message": message } })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request counting
// ============================================================================

/// Record `api_requests_total` for every routed request
pub async fn track_requests(
    State(state): State<AppStateArc>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    state
        .observer
        .api_request(&method, &endpoint, response.status().as_u16());
    response
}

// ============================================================================
// Health Routes
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    collector: String,
    fields_tracked: usize,
}

async fn health_check(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    let collector = state
        .collector
        .as_ref()
        .map(|c| format!("{:?}", c.state()).to_lowercase())
        .unwrap_or_else(|| "disabled".to_string());

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        collector,
        fields_tracked: state.sensors.len().await,
    })
}

// ============================================================================
// Decision Routes
// ============================================================================

pub fn decision_routes() -> Router<AppStateArc> {
    Router::new().route("/api/v1/decision", post(get_decision))
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub query: String,
    #[serde(default)]
    pub field_id: Option<String>,
    #[serde(default)]
    pub sensor_data: Option<SensorReading>,
}

async fn get_decision(
    State(state): State<AppStateArc>,
    ApiJson(req): ApiJson<DecisionRequest>,
) -> ApiResult<Json<DecisionResult>> {
    info!("  Decision request: {}", req.query);
    let ctx = state.request_context();

    let sensor = match (req.sensor_data, req.field_id.as_deref()) {
        (Some(reading), _) => Some(reading),
        (None, Some(field_id)) => state.sensors.latest(field_id).await,
        (None, None) => None,
    };

    let decision = state
        .composer
        .get_decision(&ctx, &req.query, req.field_id.as_deref(), sensor.as_ref())
        .await?;
    Ok(Json(decision))
}

// ============================================================================
// Knowledge Routes
// ============================================================================

pub fn knowledge_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/v1/knowledge", post(add_knowledge))
        .route("/api/v1/knowledge/batch", post(add_knowledge_batch))
        .route("/api/v1/knowledge/search", post(search_knowledge))
}

#[derive(Debug, Deserialize)]
pub struct AddKnowledgeRequest {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct BatchKnowledgeRequest {
    pub documents: Vec<AddKnowledgeRequest>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub field_id: Option<String>,
    #[serde(default)]
    pub sensor_data: Option<SensorReading>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub documents: Vec<String>,
}

/// Index payload values are strings; other JSON values keep their JSON text
pub fn stringify_metadata(metadata: HashMap<String, Value>) -> Payload {
    metadata
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect()
}

async fn add_knowledge(
    State(state): State<AppStateArc>,
    ApiJson(req): ApiJson<AddKnowledgeRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let ctx = state.request_context();
    state
        .knowledge
        .add_knowledge(&ctx, &req.id, &req.text, stringify_metadata(req.metadata))
        .await?;

    info!("  Knowledge document added: {}", req.id);
    Ok((StatusCode::CREATED, Json(json!({ "id": req.id }))))
}

async fn add_knowledge_batch(
    State(state): State<AppStateArc>,
    ApiJson(req): ApiJson<BatchKnowledgeRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let ctx = state.request_context();
    let documents = req
        .documents
        .into_iter()
        .map(|d| NewDocument {
            id: d.id,
            text: d.text,
            metadata: stringify_metadata(d.metadata),
        })
        .collect();

    let added = state.knowledge.add_knowledge_batch(&ctx, documents).await?;
    Ok((StatusCode::CREATED, Json(json!({ "added": added }))))
}

async fn search_knowledge(
    State(state): State<AppStateArc>,
    ApiJson(req): ApiJson<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let ctx = state.request_context();
    let sensor = match (req.sensor_data, req.field_id.as_deref()) {
        (Some(reading), _) => Some(reading),
        (None, Some(field_id)) => state.sensors.latest(field_id).await,
        (None, None) => None,
    };

    let documents = state
        .knowledge
        .search_knowledge(&ctx, &req.query, sensor.as_ref())
        .await?;
    Ok(Json(SearchResponse { documents }))
}

// ============================================================================
// Sensor Routes
// ============================================================================

pub fn sensor_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/v1/sensors/data", post(receive_reading))
        .route("/api/v1/sensors/publish", post(publish_reading))
        .route("/api/v1/sensors/:field_id", get(latest_reading))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Value,
}

async fn latest_reading(
    State(state): State<AppStateArc>,
    Path(field_id): Path<String>,
) -> ApiResult<Json<SensorReading>> {
    state
        .sensors
        .latest(&field_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no readings for field '{}'", field_id)))
}

/// Accept a reading over HTTP. With an ingest queue it travels the same path
/// as bus readings; without one it goes straight into the context store.
async fn receive_reading(
    State(state): State<AppStateArc>,
    ApiJson(reading): ApiJson<SensorReading>,
) -> ApiResult<Json<Value>> {
    if reading.device_id.trim().is_empty() {
        return Err(AgriError::validation("device_id must not be empty").into());
    }
    let reading = stamp_reading(reading);
    let id = reading.id.clone();

    match &state.ingest {
        Some(queue) => {
            if !queue.offer(reading) {
                return Err(ApiError::Unavailable(
                    "sensor ingest queue is full".to_string(),
                ));
            }
        }
        None => {
            state
                .observer
                .sensor_reading_received(reading.device_type(), reading.field_id());
            state.sensors.record(reading).await;
        }
    }

    info!("  Sensor reading received: {}", id);
    Ok(Json(json!({
        "status": "received",
        "message": "Sensor data processed successfully",
        "id": id,
    })))
}

async fn publish_reading(
    State(state): State<AppStateArc>,
    ApiJson(req): ApiJson<PublishRequest>,
) -> ApiResult<StatusCode> {
    let collector = state
        .collector
        .as_ref()
        .ok_or_else(|| ApiError::Internal("message bus collector is not running".to_string()))?;

    let bytes = match req.payload {
        Value::String(s) => s.into_bytes(),
        other => serde_json::to_vec(&other).map_err(|e| ApiError::Internal(e.to_string()))?,
    };
    collector.publish(&req.topic, bytes)?;
    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// Metrics Routes
// ============================================================================

pub fn metrics_routes() -> Router<AppStateArc> {
    Router::new().route("/metrics", get(render_metrics))
}

async fn render_metrics(State(state): State<AppStateArc>) -> ApiResult<Response> {
    let Some(metrics) = &state.metrics else {
        return Err(ApiError::NotFound("metrics are disabled".to_string()));
    };
    let body = metrics
        .render()
        .map_err(|e| ApiError::Internal(format!("failed to render metrics: {}", e)))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
