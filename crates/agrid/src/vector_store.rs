//! Vector index client.
//!
//! Owns one named, fixed-dimension collection of vectors plus string payloads.
//! Two backends implement `VectorIndex`:
//! - `QdrantIndex`: talks to a Qdrant server over its HTTP API
//! - `MemoryIndex`: in-process brute-force cosine search (development/tests)
//!
//! Callers address points by string id; `to_point_id` maps them to the numeric
//! ids the store uses.

use crate::config::VectorStoreConfig;
use crate::context::CallContext;
use crate::http::{build_client, expect_json, transport_error};
use crate::metrics::Observer;
use agri_common::{AgriError, AgriResult, Payload, ScoredPoint, SearchResult, Stage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Map a caller-supplied string id to a numeric point id.
///
/// Order-sensitive polynomial hash over the characters and their byte
/// offsets, with wrapping u64 arithmetic. One-way: the string id cannot be
/// recovered. Distinct ids can collide, in which case the later upsert
/// replaces the earlier point; nothing guards against this.
pub fn to_point_id(id: &str) -> u64 {
    id.char_indices().fold(0u64, |acc, (pos, c)| {
        acc.wrapping_mul(31)
            .wrapping_add(c as u64)
            .wrapping_add(pos as u64)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
}

/// Name, width and metric of a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: usize,
    pub distance: Distance,
}

impl CollectionSpec {
    pub fn cosine(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            distance: Distance::Cosine,
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if it does not exist yet; idempotent
    async fn ensure_collection(&self, ctx: &CallContext) -> AgriResult<()>;

    /// Insert or replace the point for `id`; vector and payload land together
    async fn upsert(
        &self,
        ctx: &CallContext,
        id: &str,
        vector: Vec<f32>,
        payload: Payload,
    ) -> AgriResult<()>;

    /// Up to `limit` nearest points, best first, payloads attached
    async fn search(
        &self,
        ctx: &CallContext,
        vector: &[f32],
        limit: usize,
    ) -> AgriResult<SearchResult>;

    fn collection(&self) -> &CollectionSpec;
}

fn check_dimension(spec: &CollectionSpec, vector: &[f32]) -> AgriResult<()> {
    if vector.len() != spec.dimension {
        return Err(AgriError::validation(format!(
            "vector has {} dimensions, collection '{}' expects {}",
            vector.len(),
            spec.name,
            spec.dimension
        )));
    }
    Ok(())
}

// ============================================================================
// Qdrant backend
// ============================================================================

#[derive(Debug, Deserialize)]
struct QdrantReply<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionList {
    collections: Vec<CollectionDescription>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Debug, Serialize)]
struct VectorParams {
    size: usize,
    distance: Distance,
}

#[derive(Debug, Serialize)]
struct UpsertPoints<'a> {
    points: [PointStruct<'a>; 1],
}

#[derive(Debug, Serialize)]
struct PointStruct<'a> {
    id: u64,
    vector: &'a [f32],
    payload: &'a Payload,
}

#[derive(Debug, Serialize)]
struct SearchPoints<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct QdrantScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<HashMap<String, serde_json::Value>>,
}

impl From<QdrantScoredPoint> for ScoredPoint {
    fn from(point: QdrantScoredPoint) -> Self {
        let payload = point
            .payload
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        ScoredPoint {
            score: point.score,
            payload,
        }
    }
}

/// Qdrant-backed index client. Cheap to share across requests.
pub struct QdrantIndex {
    http: reqwest::Client,
    base_url: String,
    spec: CollectionSpec,
    observer: Arc<dyn Observer>,
}

impl QdrantIndex {
    /// Build the client and make sure the collection exists.
    ///
    /// Failing to reach the store here is fatal to startup.
    pub async fn connect(
        config: &VectorStoreConfig,
        dimension: usize,
        observer: Arc<dyn Observer>,
        ctx: &CallContext,
    ) -> Result<Self> {
        let index = Self::new(config, dimension, observer)?;
        index
            .ensure_collection(ctx)
            .await
            .with_context(|| format!("Failed to connect to Qdrant at {}", config.url))?;
        Ok(index)
    }

    /// Build the client without contacting the server
    pub fn new(
        config: &VectorStoreConfig,
        dimension: usize,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config.url.trim_end_matches('/').to_string(),
            spec: CollectionSpec::cosine(config.collection.clone(), dimension),
            observer,
        })
    }

    async fn list_collections(&self) -> AgriResult<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/collections", self.base_url))
            .send()
            .await
            .map_err(|e| transport_error(Stage::VectorCollection, e))?;
        let reply: QdrantReply<CollectionList> =
            expect_json(Stage::VectorCollection, response).await?;
        Ok(reply.result.collections.into_iter().map(|c| c.name).collect())
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> AgriResult<()> {
        let body = CreateCollection {
            vectors: VectorParams {
                size: spec.dimension,
                distance: spec.distance,
            },
        };
        let response = self
            .http
            .put(format!("{}/collections/{}", self.base_url, spec.name))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Stage::VectorCollection, e))?;

        let status = response.status();
        if status.is_success() {
            info!("Created collection '{}' ({} dims)", spec.name, spec.dimension);
            return Ok(());
        }

        // Lost a creation race with another caller
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT || text.contains("already exists") {
            debug!("Collection '{}' already exists", spec.name);
            return Ok(());
        }

        Err(AgriError::upstream(
            Stage::VectorCollection,
            format!("create '{}' returned HTTP {}: {}", spec.name, status.as_u16(), text),
        ))
    }

    /// Idempotently ensure an arbitrary collection exists
    pub async fn create_collection_if_absent(
        &self,
        ctx: &CallContext,
        spec: &CollectionSpec,
    ) -> AgriResult<()> {
        ctx.run(Stage::VectorCollection, async {
            let existing = self.list_collections().await?;
            if existing.iter().any(|name| name == &spec.name) {
                return Ok(());
            }
            self.create_collection(spec).await
        })
        .await
    }

    async fn send_upsert(&self, point_id: u64, vector: &[f32], payload: &Payload) -> AgriResult<()> {
        let body = UpsertPoints {
            points: [PointStruct {
                id: point_id,
                vector,
                payload,
            }],
        };
        let response = self
            .http
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.base_url, self.spec.name
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Stage::VectorUpsert, e))?;
        let _: QdrantReply<serde_json::Value> = expect_json(Stage::VectorUpsert, response).await?;
        Ok(())
    }

    async fn send_search(&self, vector: &[f32], limit: usize) -> AgriResult<SearchResult> {
        let body = SearchPoints {
            vector,
            limit,
            with_payload: true,
        };
        let response = self
            .http
            .post(format!(
                "{}/collections/{}/points/search",
                self.base_url, self.spec.name
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Stage::VectorSearch, e))?;
        let reply: QdrantReply<Vec<QdrantScoredPoint>> =
            expect_json(Stage::VectorSearch, response).await?;
        let points = reply.result.into_iter().map(ScoredPoint::from).collect();
        Ok(SearchResult::ranked(points, limit))
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, ctx: &CallContext) -> AgriResult<()> {
        self.create_collection_if_absent(ctx, &self.spec).await
    }

    async fn upsert(
        &self,
        ctx: &CallContext,
        id: &str,
        vector: Vec<f32>,
        payload: Payload,
    ) -> AgriResult<()> {
        check_dimension(&self.spec, &vector)?;
        let point_id = to_point_id(id);
        ctx.run(
            Stage::VectorUpsert,
            self.send_upsert(point_id, &vector, &payload),
        )
        .await?;
        debug!("Upserted '{}' as point {}", id, point_id);
        Ok(())
    }

    async fn search(
        &self,
        ctx: &CallContext,
        vector: &[f32],
        limit: usize,
    ) -> AgriResult<SearchResult> {
        check_dimension(&self.spec, vector)?;
        let start = Instant::now();
        let result = ctx
            .run(Stage::VectorSearch, self.send_search(vector, limit))
            .await;
        self.observer.vector_search(start.elapsed());
        result
    }

    fn collection(&self) -> &CollectionSpec {
        &self.spec
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Cosine similarity; 0.0 for mismatched or zero-magnitude vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Brute-force cosine index held in process memory
pub struct MemoryIndex {
    spec: CollectionSpec,
    points: RwLock<HashMap<u64, (Vec<f32>, Payload)>>,
    observer: Arc<dyn Observer>,
}

impl MemoryIndex {
    pub fn new(spec: CollectionSpec, observer: Arc<dyn Observer>) -> Self {
        Self {
            spec,
            points: RwLock::new(HashMap::new()),
            observer,
        }
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, _ctx: &CallContext) -> AgriResult<()> {
        Ok(())
    }

    async fn upsert(
        &self,
        ctx: &CallContext,
        id: &str,
        vector: Vec<f32>,
        payload: Payload,
    ) -> AgriResult<()> {
        check_dimension(&self.spec, &vector)?;
        if ctx.is_done() {
            return Err(AgriError::cancelled(Stage::VectorUpsert));
        }
        self.points
            .write()
            .await
            .insert(to_point_id(id), (vector, payload));
        Ok(())
    }

    async fn search(
        &self,
        ctx: &CallContext,
        vector: &[f32],
        limit: usize,
    ) -> AgriResult<SearchResult> {
        if ctx.is_done() {
            return Err(AgriError::cancelled(Stage::VectorSearch));
        }
        check_dimension(&self.spec, vector)?;
        let start = Instant::now();
        let points = self.points.read().await;
        let scored = points
            .values()
            .map(|(stored, payload)| ScoredPoint {
                score: cosine_similarity(vector, stored),
                payload: payload.clone(),
            })
            .collect();
        drop(points);
        self.observer.vector_search(start.elapsed());
        Ok(SearchResult::ranked(scored, limit))
    }

    fn collection(&self) -> &CollectionSpec {
        &self.spec
    }
}
