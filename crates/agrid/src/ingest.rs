//! Telemetry ingestion: MQTT collector, bounded delivery queue, consumer.
//!
//! The collector and the HTTP intake are the only writers to the queue.
//! Enqueue never blocks: when the queue is full the newest reading is
//! dropped and counted.

use crate::config::MqttConfig;
use crate::metrics::Observer;
use agri_common::{AgriError, AgriResult, SensorReading, Stage};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Topics the collector subscribes to on a fresh session
pub const SENSOR_TOPICS: [&str; 3] = [
    "sensors/soil/+/data",
    "sensors/weather/+/data",
    "sensors/crop/+/data",
];

/// Capacity of rumqttc's request channel (publish/subscribe/disconnect)
const REQUEST_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Bounded queue
// ============================================================================

/// Producer half of the ingestion queue
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<SensorReading>,
    observer: Arc<dyn Observer>,
}

/// Consumer half; clones share one receiver, so each reading is seen once.
///
/// tokio's bounded channel is single-consumer. The mutex only serializes
/// consumers against each other; the collector never touches it, so a slow
/// consumer cannot stall enqueue.
#[derive(Clone)]
pub struct IngestReceiver {
    rx: Arc<Mutex<mpsc::Receiver<SensorReading>>>,
}

/// Create a queue holding at most `capacity` readings (minimum 1)
pub fn ingest_queue(capacity: usize, observer: Arc<dyn Observer>) -> (IngestQueue, IngestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        IngestQueue { tx, observer },
        IngestReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl IngestQueue {
    /// Enqueue without waiting. Returns false if the reading was dropped.
    pub fn offer(&self, reading: SensorReading) -> bool {
        match self.tx.try_send(reading) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(reading)) => {
                warn!(
                    "Ingest queue full, dropping reading from {}",
                    reading.device_id
                );
                self.observer.sensor_reading_dropped("queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.observer.sensor_reading_dropped("queue_closed");
                false
            }
        }
    }
}

impl IngestReceiver {
    /// Next reading, or None once every producer is gone and the queue is drained
    pub async fn recv(&self) -> Option<SensorReading> {
        self.rx.lock().await.recv().await
    }

    /// Non-waiting variant of `recv`
    pub async fn try_recv(&self) -> Option<SensorReading> {
        self.rx.lock().await.try_recv().ok()
    }
}

/// Decode an inbound payload. Readings without an id or timestamp are
/// stamped on arrival.
pub fn decode_reading(payload: &[u8]) -> AgriResult<SensorReading> {
    let reading: SensorReading =
        serde_json::from_slice(payload).map_err(|e| AgriError::Deserialization(e.to_string()))?;
    Ok(stamp_reading(reading))
}

/// Fill in a missing id (random UUID) and timestamp (now)
pub fn stamp_reading(mut reading: SensorReading) -> SensorReading {
    if reading.id.is_empty() {
        reading.id = Uuid::new_v4().to_string();
    }
    if reading.timestamp == DateTime::<Utc>::default() {
        reading.timestamp = Utc::now();
    }
    reading
}

// ============================================================================
// Collector
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Disconnected,
    Connecting,
    Subscribed,
    ShuttingDown,
}

/// Cloneable handle for publishing and watching the collector
#[derive(Clone)]
pub struct CollectorHandle {
    client: AsyncClient,
    state: watch::Receiver<CollectorState>,
}

impl CollectorHandle {
    /// Fire-and-forget publish at QoS 0. Only reports whether the request
    /// was handed to the transport.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> AgriResult<()> {
        if topic.trim().is_empty() {
            return Err(AgriError::validation("topic must not be empty"));
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| AgriError::upstream(Stage::MessageBus, e.to_string()))
    }

    pub fn state(&self) -> CollectorState {
        *self.state.borrow()
    }
}

pub struct MqttCollector {
    client_id: String,
    client: AsyncClient,
    eventloop: EventLoop,
    queue: IngestQueue,
    observer: Arc<dyn Observer>,
    state: watch::Sender<CollectorState>,
    reconnect_delay: Duration,
    disconnect_grace: Duration,
}

impl MqttCollector {
    /// Build the collector. No network I/O happens until `run`.
    pub fn new(
        config: &MqttConfig,
        queue: IngestQueue,
        observer: Arc<dyn Observer>,
    ) -> Result<(Self, CollectorHandle)> {
        let (host, port) = config.broker_addr()?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
        // Persistent session: subscriptions survive reconnects
        options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(CollectorState::Disconnected);

        let handle = CollectorHandle {
            client: client.clone(),
            state: state_rx,
        };
        let collector = Self {
            client_id: config.client_id.clone(),
            client,
            eventloop,
            queue,
            observer,
            state: state_tx,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            disconnect_grace: config.disconnect_grace(),
        };
        Ok((collector, handle))
    }

    pub fn state(&self) -> CollectorState {
        *self.state.borrow()
    }

    /// Decode one message and offer it to the queue. Malformed payloads are
    /// logged and dropped. Returns whether the reading was enqueued.
    pub fn handle_payload(&self, topic: &str, payload: &[u8]) -> bool {
        match decode_reading(payload) {
            Ok(reading) => {
                debug!("Reading from {} on {}", reading.device_id, topic);
                self.queue.offer(reading)
            }
            Err(e) => {
                warn!("Dropping message on {}: {}", topic, e);
                self.observer.sensor_reading_dropped("malformed");
                false
            }
        }
    }

    /// Drive the event loop until `token` is cancelled, then disconnect
    /// within the grace period.
    pub async fn run(mut self, token: CancellationToken) {
        info!("Collector starting as {}", self.client_id);
        self.set_state(CollectorState::Connecting);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(event) => self.on_event(event),
                    Err(e) => {
                        if !self.on_connection_error(e, &token).await {
                            break;
                        }
                    }
                },
            }
        }

        self.shutdown().await;
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("Connected to broker (session present: {})", ack.session_present);
                self.observer.bus_connected(true);
                if !ack.session_present {
                    self.subscribe();
                }
                self.set_state(CollectorState::Subscribed);
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.handle_payload(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let failed = ack
                    .return_codes
                    .iter()
                    .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                    .count();
                if failed > 0 {
                    warn!("Broker rejected {} subscriptions", failed);
                }
            }
            _ => {}
        }
    }

    fn subscribe(&self) {
        for topic in SENSOR_TOPICS {
            match self.client.try_subscribe(topic, QoS::AtMostOnce) {
                Ok(()) => info!("Subscribed to {}", topic),
                Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
            }
        }
    }

    /// Returns false if cancellation arrived while waiting to reconnect
    async fn on_connection_error(&mut self, err: ConnectionError, token: &CancellationToken) -> bool {
        if self.state() == CollectorState::Subscribed {
            self.observer.bus_connected(false);
        }
        warn!("Broker connection lost: {}", err);
        self.set_state(CollectorState::Disconnected);

        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(self.reconnect_delay) => {}
        }

        self.set_state(CollectorState::Connecting);
        true
    }

    async fn shutdown(&mut self) {
        let was_connected = self.state() == CollectorState::Subscribed;
        self.set_state(CollectorState::ShuttingDown);
        info!("Collector shutting down");

        if was_connected && self.client.try_disconnect().is_ok() {
            let drained = tokio::time::timeout(self.disconnect_grace, async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("Disconnect did not complete within {:?}", self.disconnect_grace);
            }
            self.observer.bus_connected(false);
        }

        self.set_state(CollectorState::Disconnected);
    }

    fn set_state(&self, state: CollectorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Collector state {:?} -> {:?}", previous, state);
        }
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Latest reading per field id
#[derive(Default)]
pub struct SensorContextStore {
    readings: RwLock<HashMap<String, SensorReading>>,
}

impl SensorContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored reading for the reading's field
    pub async fn record(&self, reading: SensorReading) {
        let field_id = reading.field_id().to_string();
        self.readings.write().await.insert(field_id, reading);
    }

    pub async fn latest(&self, field_id: &str) -> Option<SensorReading> {
        self.readings.read().await.get(field_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.readings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.readings.read().await.is_empty()
    }
}

/// Drain the queue into the store until cancelled or the queue closes
pub async fn run_consumer(
    receiver: IngestReceiver,
    store: Arc<SensorContextStore>,
    observer: Arc<dyn Observer>,
    token: CancellationToken,
) {
    loop {
        let reading = tokio::select! {
            _ = token.cancelled() => break,
            next = receiver.recv() => match next {
                Some(reading) => reading,
                None => break,
            },
        };

        observer.sensor_reading_received(reading.device_type(), reading.field_id());
        store.record(reading).await;
    }
    debug!("Consumer stopped");
}
