//! Agri advisor daemon
//!
//! Serves decision and knowledge requests over HTTP and ingests sensor
//! telemetry from the MQTT broker.

use agrid::cache::MemoryCache;
use agrid::config::{AgridConfig, VectorBackend};
use agrid::context::CallContext;
use agrid::decision::DecisionComposer;
use agrid::embeddings::OllamaEmbedder;
use agrid::ingest::{ingest_queue, run_consumer, MqttCollector, SensorContextStore};
use agrid::knowledge::KnowledgeService;
use agrid::llm_client::OllamaClient;
use agrid::metrics::{Observer, PrometheusObserver};
use agrid::server::{self, AppState};
use agrid::vector_store::{CollectionSpec, MemoryIndex, QdrantIndex, VectorIndex};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often expired cache entries are pruned
const CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for the startup collection check
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "agrid")]
#[command(about = "Agricultural decision support daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to /etc/agri/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run without connecting to the MQTT broker
    #[arg(long)]
    no_mqtt: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Agri daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            let mut config = AgridConfig::load_from_path(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => AgridConfig::load(),
    };
    config.validate().context("Invalid configuration")?;

    let metrics = Arc::new(PrometheusObserver::new().context("Failed to register metrics")?);
    let observer: Arc<dyn Observer> = metrics.clone();
    let shutdown = CancellationToken::new();

    // Retrieval pipeline
    let embedder = Arc::new(OllamaEmbedder::new(&config.embedding, observer.clone())?);
    info!("Embedding model: {}", embedder.model());

    let index: Arc<dyn VectorIndex> = match config.vector_store.backend {
        VectorBackend::Qdrant => {
            let ctx = CallContext::with_token(shutdown.child_token()).with_timeout(STARTUP_TIMEOUT);
            let index = QdrantIndex::connect(
                &config.vector_store,
                config.embedding.dimension,
                observer.clone(),
                &ctx,
            )
            .await?;
            info!(
                "Vector store: qdrant at {} ({})",
                config.vector_store.url, config.vector_store.collection
            );
            Arc::new(index)
        }
        VectorBackend::Memory => {
            warn!("Vector store: in-memory, knowledge is lost on restart");
            Arc::new(MemoryIndex::new(
                CollectionSpec::cosine(
                    config.vector_store.collection.clone(),
                    config.embedding.dimension,
                ),
                observer.clone(),
            ))
        }
    };

    let cache = Arc::new(MemoryCache::new(config.retrieval.cache_capacity));
    let knowledge = Arc::new(
        KnowledgeService::new(embedder, index, observer.clone())
            .with_top_k(config.retrieval.top_k)
            .with_cache(
                cache.clone(),
                Duration::from_secs(config.retrieval.cache_ttl_secs),
            ),
    );

    let llm = Arc::new(OllamaClient::new(&config.llm, observer.clone())?);
    info!("Completion model: {}", llm.model());
    let composer = Arc::new(DecisionComposer::new(knowledge.clone(), llm));

    // Telemetry ingestion
    let sensors = Arc::new(SensorContextStore::new());
    let (queue, receiver) = ingest_queue(config.mqtt.queue_capacity, observer.clone());
    let mut tasks = Vec::new();

    let mut state = AppState::new(composer, knowledge, sensors.clone(), observer.clone())
        .with_metrics(metrics)
        .with_request_timeout(config.request_timeout())
        .with_shutdown(shutdown.clone())
        .with_ingest_queue(queue.clone());

    if cli.no_mqtt {
        warn!("MQTT disabled, sensor context comes from requests only");
    } else {
        let (collector, handle) = MqttCollector::new(&config.mqtt, queue, observer.clone())?;
        info!("MQTT broker: {}", config.mqtt.broker);
        tasks.push(tokio::spawn(collector.run(shutdown.clone())));
        state = state.with_collector(handle);
    }

    tasks.push(tokio::spawn(run_consumer(
        receiver,
        sensors,
        observer.clone(),
        shutdown.clone(),
    )));

    let prune_token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = prune_token.cancelled() => break,
                _ = interval.tick() => cache.prune_expired().await,
            }
        }
    }));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutting down gracefully");
        signal_token.cancel();
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.server.bind, config.server.port))?;
    let result = server::run(state, addr).await;

    // Server errors also stop the background tasks
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed: {}", e);
        }
    }

    result
}
