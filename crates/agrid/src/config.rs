//! Configuration management for agrid.
//!
//! Loads settings from /etc/agri/config.toml or uses defaults, then applies
//! environment overrides (PORT, QDRANT_URL, OLLAMA_URL, MQTT_BROKER,
//! EMBEDDING_API_URL, EMBEDDING_MODEL, LLM_MODEL).

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/agri/config.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/agri/config.toml";

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Deadline applied to every decision/knowledge request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Embedding model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector width produced by the model; the index collection must agree
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimension() -> usize {
    768
}

fn default_embedding_timeout() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

/// Completion model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: VectorBackend,

    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,
}

fn default_backend() -> VectorBackend {
    VectorBackend::Qdrant
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection() -> String {
    "agricultural_knowledge".to_string()
}

fn default_vector_timeout() -> u64 {
    10
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_qdrant_url(),
            collection: default_collection(),
            timeout_secs: default_vector_timeout(),
        }
    }
}

/// Message bus (telemetry ingestion)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Capacity of the bounded delivery queue; readings beyond it are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_ms: u64,
}

fn default_broker() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "iot-collector".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_disconnect_grace() -> u64 {
    250
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: default_client_id(),
            queue_capacity: default_queue_capacity(),
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_ms: default_reconnect_delay(),
            disconnect_grace_ms: default_disconnect_grace(),
        }
    }
}

impl MqttConfig {
    /// Split the broker URL (`tcp://host:port`, `mqtt://host:port` or `host:port`)
    pub fn broker_addr(&self) -> Result<(String, u16)> {
        let rest = self
            .broker
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(&self.broker);
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("broker '{}' is missing a port", self.broker))?;
        if host.is_empty() {
            bail!("broker '{}' is missing a host", self.broker);
        }
        let port: u16 = port
            .trim_end_matches('/')
            .parse()
            .with_context(|| format!("broker '{}' has an invalid port", self.broker))?;
        Ok((host.to_string(), port))
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Retrieval orchestration knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    1_000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgridConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl AgridConfig {
    /// Load config from the standard paths, or defaults, then apply the environment
    pub fn load() -> Self {
        let mut config = Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                AgridConfig::default()
            });
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AgridConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides; empty values are ignored
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(port) = get("PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!("Ignoring invalid PORT={}", port),
            }
        }
        if let Some(url) = get("QDRANT_URL") {
            self.vector_store.url = url;
        }
        if let Some(url) = get("OLLAMA_URL") {
            self.llm.url = url;
        }
        if let Some(broker) = get("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(url) = get("EMBEDDING_API_URL") {
            self.embedding.url = url;
        }
        if let Some(model) = get("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(model) = get("LLM_MODEL") {
            self.llm.model = model;
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            bail!("embedding.dimension must be greater than zero");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be greater than zero");
        }
        if self.mqtt.queue_capacity == 0 {
            bail!("mqtt.queue_capacity must be greater than zero");
        }
        if self.retrieval.cache_capacity == 0 {
            bail!("retrieval.cache_capacity must be greater than zero");
        }
        self.mqtt.broker_addr()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}
