//! Observability for the pipeline and the ingestion path.
//!
//! Components receive an `Arc<dyn Observer>` at construction and record
//! through it; nothing writes to process-wide metric globals.

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, Histogram, HistogramVec, IntCounter,
    IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Sink for pipeline and ingestion events
pub trait Observer: Send + Sync {
    /// A queued telemetry reading was delivered to the consumer
    fn sensor_reading_received(&self, device_type: &str, field_id: &str);

    /// A telemetry reading was dropped (queue full or malformed payload)
    fn sensor_reading_dropped(&self, reason: &str);

    fn rag_query(&self, query_type: &str, elapsed: Duration);

    fn embedding_request(&self, elapsed: Duration);

    fn vector_search(&self, elapsed: Duration);

    fn llm_request(&self, elapsed: Duration);

    fn api_request(&self, method: &str, endpoint: &str, status: u16);

    fn bus_connected(&self, connected: bool);
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn sensor_reading_received(&self, _device_type: &str, _field_id: &str) {}
    fn sensor_reading_dropped(&self, _reason: &str) {}
    fn rag_query(&self, _query_type: &str, _elapsed: Duration) {}
    fn embedding_request(&self, _elapsed: Duration) {}
    fn vector_search(&self, _elapsed: Duration) {}
    fn llm_request(&self, _elapsed: Duration) {}
    fn api_request(&self, _method: &str, _endpoint: &str, _status: u16) {}
    fn bus_connected(&self, _connected: bool) {}
}

/// Prometheus-backed observer with its own registry
#[derive(Clone)]
pub struct PrometheusObserver {
    pub sensor_data_received_total: CounterVec,
    pub sensor_data_dropped_total: CounterVec,
    pub rag_query_duration_seconds: HistogramVec,
    pub embedding_request_duration_seconds: Histogram,
    pub vector_search_duration_seconds: Histogram,
    pub llm_request_duration_seconds: Histogram,
    pub api_requests_total: CounterVec,
    pub active_mqtt_connections: IntGauge,
    pub bus_disconnects_total: IntCounter,

    registry: Arc<Registry>,
}

impl PrometheusObserver {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sensor_data_received_total = register_counter_vec_with_registry!(
            "sensor_data_received_total",
            "Total number of sensor data points received",
            &["device_type", "field_id"],
            registry
        )?;

        let sensor_data_dropped_total = register_counter_vec_with_registry!(
            "sensor_data_dropped_total",
            "Total number of sensor data points dropped by reason",
            &["reason"],
            registry
        )?;

        let rag_query_duration_seconds = register_histogram_vec_with_registry!(
            "rag_query_duration_seconds",
            "Time spent processing RAG queries",
            &["query_type"],
            prometheus::DEFAULT_BUCKETS.to_vec(),
            registry
        )?;

        let embedding_request_duration_seconds = register_histogram_with_registry!(
            "embedding_request_duration_seconds",
            "Time spent on embedding requests",
            registry
        )?;

        let vector_search_duration_seconds = register_histogram_with_registry!(
            "vector_search_duration_seconds",
            "Time spent on vector database searches",
            registry
        )?;

        let llm_request_duration_seconds = register_histogram_with_registry!(
            "llm_request_duration_seconds",
            "Time spent on LLM requests",
            registry
        )?;

        let api_requests_total = register_counter_vec_with_registry!(
            "api_requests_total",
            "Total number of API requests",
            &["method", "endpoint", "status"],
            registry
        )?;

        let active_mqtt_connections = register_int_gauge_with_registry!(
            "active_mqtt_connections",
            "Number of active MQTT connections",
            registry
        )?;

        let bus_disconnects_total = register_int_counter_with_registry!(
            "mqtt_disconnects_total",
            "Total number of message bus disconnections",
            registry
        )?;

        Ok(Self {
            sensor_data_received_total,
            sensor_data_dropped_total,
            rag_query_duration_seconds,
            embedding_request_duration_seconds,
            vector_search_duration_seconds,
            llm_request_duration_seconds,
            api_requests_total,
            active_mqtt_connections,
            bus_disconnects_total,
            registry: Arc::new(registry),
        })
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Observer for PrometheusObserver {
    fn sensor_reading_received(&self, device_type: &str, field_id: &str) {
        self.sensor_data_received_total
            .with_label_values(&[device_type, field_id])
            .inc();
    }

    fn sensor_reading_dropped(&self, reason: &str) {
        self.sensor_data_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    fn rag_query(&self, query_type: &str, elapsed: Duration) {
        self.rag_query_duration_seconds
            .with_label_values(&[query_type])
            .observe(elapsed.as_secs_f64());
    }

    fn embedding_request(&self, elapsed: Duration) {
        self.embedding_request_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    fn vector_search(&self, elapsed: Duration) {
        self.vector_search_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    fn llm_request(&self, elapsed: Duration) {
        self.llm_request_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    fn api_request(&self, method: &str, endpoint: &str, status: u16) {
        let status = status.to_string();
        self.api_requests_total
            .with_label_values(&[method, endpoint, status.as_str()])
            .inc();
    }

    fn bus_connected(&self, connected: bool) {
        if connected {
            self.active_mqtt_connections.set(1);
        } else {
            if self.active_mqtt_connections.get() > 0 {
                self.bus_disconnects_total.inc();
            }
            self.active_mqtt_connections.set(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PrometheusObserver::new().unwrap();
        assert_eq!(metrics.active_mqtt_connections.get(), 0);
    }

    #[test]
    fn test_sensor_counters() {
        let metrics = PrometheusObserver::new().unwrap();
        metrics.sensor_reading_received("soil", "field_001");
        metrics.sensor_reading_received("soil", "field_001");
        metrics.sensor_reading_dropped("queue_full");

        assert_eq!(
            metrics
                .sensor_data_received_total
                .with_label_values(&["soil", "field_001"])
                .get(),
            2.0
        );
        assert_eq!(
            metrics
                .sensor_data_dropped_total
                .with_label_values(&["queue_full"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_bus_connection_gauge() {
        let metrics = PrometheusObserver::new().unwrap();
        metrics.bus_connected(true);
        assert_eq!(metrics.active_mqtt_connections.get(), 1);
        metrics.bus_connected(false);
        assert_eq!(metrics.active_mqtt_connections.get(), 0);
        assert_eq!(metrics.bus_disconnects_total.get(), 1);
    }

    #[test]
    fn test_render_exposition() {
        let metrics = PrometheusObserver::new().unwrap();
        metrics.llm_request(Duration::from_millis(250));
        metrics.api_request("POST", "/api/v1/decision", 200);

        let output = metrics.render().unwrap();
        assert!(output.contains("llm_request_duration_seconds"));
        assert!(output.contains("api_requests_total"));
    }
}
