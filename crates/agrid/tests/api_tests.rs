//! HTTP surface tests, driven through the router without binding a socket.

use agri_common::{
    AgriResult, ChatMessage, CompletionResponse, Location, Measurement, MeasurementValue,
    SensorReading, Tool,
};
use agrid::context::CallContext;
use agrid::decision::DecisionComposer;
use agrid::embeddings::Embedder;
use agrid::ingest::{ingest_queue, IngestQueue, SensorContextStore};
use agrid::knowledge::KnowledgeService;
use agrid::llm_client::CompletionClient;
use agrid::metrics::{NoopObserver, Observer, PrometheusObserver};
use agrid::server::{router, AppState};
use agrid::vector_store::{CollectionSpec, MemoryIndex};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Constant vector; remembers what it was asked to embed
#[derive(Default)]
struct RecordingEmbedder {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl Embedder for RecordingEmbedder {
    async fn embed(&self, _ctx: &CallContext, text: &str) -> AgriResult<Vec<f32>> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(vec![1.0, 0.5])
    }
}

struct FixedLlm;

#[async_trait]
impl CompletionClient for FixedLlm {
    async fn chat(
        &self,
        _ctx: &CallContext,
        _messages: &[ChatMessage],
        _tools: Option<&[Tool]>,
    ) -> AgriResult<CompletionResponse> {
        Ok(CompletionResponse {
            message: ChatMessage::assistant("Water the field and watch for pests."),
            tool_calls: vec![],
            done: true,
        })
    }
}

struct TestApp {
    router: Router,
    embedder: Arc<RecordingEmbedder>,
    sensors: Arc<SensorContextStore>,
}

fn test_app(metrics: Option<Arc<PrometheusObserver>>) -> TestApp {
    test_app_with(metrics, None)
}

fn test_app_with(metrics: Option<Arc<PrometheusObserver>>, ingest: Option<IngestQueue>) -> TestApp {
    let observer: Arc<dyn Observer> = match &metrics {
        Some(m) => m.clone(),
        None => Arc::new(NoopObserver),
    };
    let embedder = Arc::new(RecordingEmbedder::default());
    let index = Arc::new(MemoryIndex::new(
        CollectionSpec::cosine("agricultural_knowledge", 2),
        observer.clone(),
    ));
    let knowledge = Arc::new(KnowledgeService::new(
        embedder.clone(),
        index,
        observer.clone(),
    ));
    let composer = Arc::new(DecisionComposer::new(knowledge.clone(), Arc::new(FixedLlm)));
    let sensors = Arc::new(SensorContextStore::new());

    let mut state = AppState::new(composer, knowledge, sensors.clone(), observer);
    if let Some(m) = metrics {
        state = state.with_metrics(m);
    }
    if let Some(queue) = ingest {
        state = state.with_ingest_queue(queue);
    }

    TestApp {
        router: router(Arc::new(state)),
        embedder,
        sensors,
    }
}

fn reading(field: &str, moisture: f64) -> SensorReading {
    let mut measurements = HashMap::new();
    measurements.insert(
        "soil_moisture".to_string(),
        Measurement {
            value: MeasurementValue::Number(moisture),
            unit: "%".to_string(),
            quality: Some("good".to_string()),
        },
    );
    SensorReading {
        id: "r-1".to_string(),
        device_id: "soil_04".to_string(),
        timestamp: Default::default(),
        location: Location {
            field_id: field.to_string(),
            crop_type: Some("wheat".to_string()),
            ..Default::default()
        },
        measurements,
        device_status: Default::default(),
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    dispatch(router, request).await
}

async fn send_raw(router: &Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    dispatch(router, request).await
}

async fn dispatch(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = test_app(None);
    let (status, body) = send(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["collector"], "disabled");
}

#[tokio::test]
async fn test_decision_blank_query_is_400() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/decision",
        Some(json!({ "query": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn test_decision_missing_query_is_structured_400() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/decision",
        Some(json!({ "field_id": "f1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("missing field `query`"));
}

#[tokio::test]
async fn test_malformed_json_is_validation_error() {
    let app = test_app(None);
    let (status, body) = send_raw(&app.router, "/api/v1/knowledge/search", "{\"query\": ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let app = test_app(None);
    let huge = json!({ "query": "x".repeat(2 * 1024 * 1024) }).to_string();
    let (status, body) = send_raw(&app.router, "/api/v1/decision", huge).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["kind"], "payload_too_large");
    assert!(app.embedder.texts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_decision_uses_latest_field_reading() {
    let app = test_app(None);
    app.sensors.record(reading("north-40", 12.0)).await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/decision",
        Some(json!({ "query": "Do I need to irrigate?", "field_id": "north-40" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["confidence"], 0.85);
    assert_eq!(
        body["actions"],
        json!(["irrigation_recommended", "pest_control_recommended"])
    );

    let texts = app.embedder.texts.lock().unwrap();
    assert_eq!(
        texts.last().map(String::as_str),
        Some(
            "Field context: Location north-40, Soil moisture: 12%, Crop type: wheat, \
             Question: Do I need to irrigate?"
        )
    );
}

#[tokio::test]
async fn test_decision_explicit_sensor_data_wins() {
    let app = test_app(None);
    app.sensors.record(reading("f1", 50.0)).await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/v1/decision",
        Some(json!({
            "query": "Water?",
            "field_id": "f1",
            "sensor_data": reading("f1", 9.5),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let texts = app.embedder.texts.lock().unwrap();
    assert!(texts.last().unwrap().contains("Soil moisture: 9.5%"));
}

#[tokio::test]
async fn test_add_then_search_knowledge() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/knowledge",
        Some(json!({
            "id": "wheat-1",
            "text": "Wheat needs 450-650 mm of water per season.",
            "metadata": { "crop": "wheat", "year": 2024 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "wheat-1");

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/knowledge/search",
        Some(json!({ "query": "wheat water" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["documents"],
        json!(["Wheat needs 450-650 mm of water per season."])
    );
}

#[tokio::test]
async fn test_batch_knowledge() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/knowledge/batch",
        Some(json!({
            "documents": [
                { "id": "a", "text": "Rotate crops yearly." },
                { "id": "b", "text": "Test soil pH every spring." }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["added"], 2);
}

#[tokio::test]
async fn test_add_knowledge_without_text_is_400() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/knowledge",
        Some(json!({ "id": "empty", "text": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn test_sensor_lookup() {
    let app = test_app(None);
    let (status, body) = send(&app.router, "GET", "/api/v1/sensors/f7", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");

    app.sensors.record(reading("f7", 31.0)).await;
    let (status, body) = send(&app.router, "GET", "/api/v1/sensors/f7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "soil_04");
    assert_eq!(body["measurements"]["soil_moisture"]["value"], 31.0);
}

#[tokio::test]
async fn test_sensor_data_is_recorded() {
    let app = test_app(None);
    let mut posted = serde_json::to_value(reading("south-2", 18.5)).unwrap();
    posted.as_object_mut().unwrap().remove("id");

    let (status, body) = send(&app.router, "POST", "/api/v1/sensors/data", Some(posted)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "received");
    let id = body["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    let (status, body) = send(&app.router, "GET", "/api/v1/sensors/south-2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["measurements"]["soil_moisture"]["value"], 18.5);
}

#[tokio::test]
async fn test_sensor_data_joins_ingest_queue() {
    let (queue, rx) = ingest_queue(1, Arc::new(NoopObserver));
    let app = test_app_with(None, Some(queue));

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/sensors/data",
        Some(serde_json::to_value(reading("f3", 40.0)).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "r-1");

    // Queue holds one reading and nothing drains it
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/sensors/data",
        Some(serde_json::to_value(reading("f3", 41.0)).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "unavailable");

    let queued = rx.try_recv().await.unwrap();
    assert_eq!(queued.field_id(), "f3");
    assert!(app.sensors.latest("f3").await.is_none());
}

#[tokio::test]
async fn test_sensor_data_without_device_is_400() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/sensors/data",
        Some(json!({ "location": { "field_id": "f1" }, "measurements": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
    assert!(app.sensors.is_empty().await);
}

#[tokio::test]
async fn test_publish_without_collector_is_500() {
    let app = test_app(None);
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/sensors/publish",
        Some(json!({ "topic": "sensors/soil/x/data", "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["kind"], "internal_error");
}

#[tokio::test]
async fn test_metrics_exposition_counts_requests() {
    let metrics = Arc::new(PrometheusObserver::new().unwrap());
    let app = test_app(Some(metrics));

    send(&app.router, "GET", "/health", None).await;
    let (status, body) = send(&app.router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);

    let text = body.as_str().unwrap();
    assert!(text.contains("api_requests_total"));
    assert!(text.contains("endpoint=\"/health\""));
}

#[tokio::test]
async fn test_metrics_disabled_is_404() {
    let app = test_app(None);
    let (status, _) = send(&app.router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
