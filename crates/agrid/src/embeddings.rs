//! Embedding adapter: text -> dense vector via the Ollama embeddings endpoint.
//!
//! One outbound request per text, no local caching. Batches run sequentially
//! and stop at the first failure.

use crate::config::EmbeddingConfig;
use crate::context::CallContext;
use crate::http::{build_client, expect_json, transport_error};
use crate::metrics::Observer;
use agri_common::{AgriError, AgriResult, Stage};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text
    async fn embed(&self, ctx: &CallContext, text: &str) -> AgriResult<Vec<f32>>;

    /// Embed texts one after another; the first failure aborts the batch
    /// and reports its index
    async fn embed_batch(&self, ctx: &CallContext, texts: &[String]) -> AgriResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            let vector = self.embed(ctx, text).await.map_err(|e| AgriError::Batch {
                index,
                source: Box::new(e),
            })?;
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// Embedder backed by an Ollama-compatible `/api/embeddings` endpoint
pub struct OllamaEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    observer: Arc<dyn Observer>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            observer,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request(&self, text: &str) -> AgriResult<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .http
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Stage::Embedding, e))?;

        let parsed: EmbeddingResponse = expect_json(Stage::Embedding, response).await?;
        if parsed.embedding.is_empty() {
            return Err(AgriError::upstream(Stage::Embedding, "no embedding returned"));
        }
        Ok(parsed.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, ctx: &CallContext, text: &str) -> AgriResult<Vec<f32>> {
        let start = Instant::now();
        let result = ctx.run(Stage::Embedding, self.request(text)).await;
        self.observer.embedding_request(start.elapsed());

        if let Ok(vector) = &result {
            debug!("Embedded {} chars into {} dims", text.len(), vector.len());
        }
        result
    }
}
