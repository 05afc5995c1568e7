//! Knowledge retrieval orchestrator.
//!
//! Augments a query with live sensor context, embeds it, runs a k-NN search
//! and returns the document texts. Also feeds new documents into the index.

use crate::cache::ResultCache;
use crate::context::CallContext;
use crate::embeddings::Embedder;
use crate::metrics::Observer;
use crate::vector_store::VectorIndex;
use agri_common::{
    AgriError, AgriResult, KnowledgeDocument, Payload, SensorReading, SOIL_MOISTURE,
    SOIL_TEMPERATURE,
};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of documents retrieved per query
pub const DEFAULT_TOP_K: usize = 5;

const CACHE_PREFIX: &str = "knowledge:";

/// Prefix `query` with a context clause built from the sensor reading.
///
/// Fields appear in a fixed order (field id, soil moisture, soil temperature,
/// crop type), each only when present.
pub fn augment_query(query: &str, sensor: Option<&SensorReading>) -> String {
    let Some(reading) = sensor else {
        return query.to_string();
    };

    let mut context = format!("Field context: Location {}, ", reading.field_id());

    if let Some(m) = reading.measurement(SOIL_MOISTURE) {
        let _ = write!(context, "Soil moisture: {}{}, ", m.value, m.unit);
    }
    if let Some(m) = reading.measurement(SOIL_TEMPERATURE) {
        let _ = write!(context, "Soil temperature: {}{}, ", m.value, m.unit);
    }
    if let Some(crop) = reading.location.crop_type.as_deref().filter(|c| !c.is_empty()) {
        let _ = write!(context, "Crop type: {}, ", crop);
    }

    context.push_str("Question: ");
    context.push_str(query);
    context
}

/// A document queued for batch ingestion
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub text: String,
    pub metadata: Payload,
}

pub struct KnowledgeService {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    cache: Option<Arc<dyn ResultCache>>,
    observer: Arc<dyn Observer>,
    top_k: usize,
    cache_ttl: Duration,
}

impl KnowledgeService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            embedder,
            index,
            cache: None,
            observer,
            top_k: DEFAULT_TOP_K,
            cache_ttl: Duration::from_secs(300),
        }
    }

    /// Memoize unenriched retrievals in `cache`
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Retrieve up to `top_k` document texts relevant to `query`
    pub async fn search_knowledge(
        &self,
        ctx: &CallContext,
        query: &str,
        sensor: Option<&SensorReading>,
    ) -> AgriResult<Vec<String>> {
        if query.trim().is_empty() {
            return Err(AgriError::validation("query must not be empty"));
        }

        let start = Instant::now();
        // Cache is keyed by the raw query, so enriched queries bypass it
        let cache_key = match (&self.cache, sensor) {
            (Some(_), None) => Some(format!("{}{}", CACHE_PREFIX, query)),
            _ => None,
        };

        if let Some(key) = &cache_key {
            if let Some(documents) = self.cache_lookup(key).await {
                debug!("Knowledge cache hit for {:?}", query);
                self.observer.rag_query("cached", start.elapsed());
                return Ok(documents);
            }
        }

        let augmented = augment_query(query, sensor);
        debug!("Augmented query: {}", augmented);

        let embedding = self.embedder.embed(ctx, &augmented).await?;
        let results = self.index.search(ctx, &embedding, self.top_k).await?;
        let documents = results.contents();

        if documents.len() < results.len() {
            warn!(
                "{} search hits lacked a content field",
                results.len() - documents.len()
            );
        }

        // Empty results are not memoized; the next add may fill them
        if let (Some(key), false) = (&cache_key, documents.is_empty()) {
            self.cache_store(key, &documents).await;
        }

        let query_type = if sensor.is_some() { "enriched" } else { "plain" };
        self.observer.rag_query(query_type, start.elapsed());
        info!(
            "Retrieved {} documents ({}) in {:?}",
            documents.len(),
            query_type,
            start.elapsed()
        );
        Ok(documents)
    }

    /// Embed `text` and upsert it under `id`
    pub async fn add_knowledge(
        &self,
        ctx: &CallContext,
        id: &str,
        text: &str,
        metadata: Payload,
    ) -> AgriResult<()> {
        validate_document(id, text)?;
        let embedding = self.embedder.embed(ctx, text).await?;
        self.store(ctx, id, text, embedding, metadata).await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Embed all texts first (sequentially), then upsert them in order.
    /// Nothing is written if any embedding fails.
    pub async fn add_knowledge_batch(
        &self,
        ctx: &CallContext,
        documents: Vec<NewDocument>,
    ) -> AgriResult<usize> {
        for doc in &documents {
            validate_document(&doc.id, &doc.text)?;
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(ctx, &texts).await?;

        let mut count = 0;
        for (doc, embedding) in documents.into_iter().zip(embeddings) {
            if let Err(e) = self
                .store(ctx, &doc.id, &doc.text, embedding, doc.metadata)
                .await
            {
                // Earlier documents are already visible to searches
                if count > 0 {
                    self.invalidate_cache().await;
                }
                return Err(e);
            }
            count += 1;
        }
        self.invalidate_cache().await;
        info!("Added {} knowledge documents", count);
        Ok(count)
    }

    async fn store(
        &self,
        ctx: &CallContext,
        id: &str,
        text: &str,
        embedding: Vec<f32>,
        metadata: Payload,
    ) -> AgriResult<()> {
        let doc = KnowledgeDocument {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
            metadata,
        };
        let payload = doc.payload();
        self.index.upsert(ctx, &doc.id, doc.embedding, payload).await?;
        debug!("Stored knowledge document '{}'", id);
        Ok(())
    }

    async fn cache_lookup(&self, key: &str) -> Option<Vec<String>> {
        let cache = self.cache.as_ref()?;
        let bytes = cache.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(documents) => Some(documents),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_prefix(CACHE_PREFIX).await;
        }
    }

    async fn cache_store(&self, key: &str, documents: &[String]) {
        let Some(cache) = &self.cache else {
            return;
        };
        match serde_json::to_vec(documents) {
            Ok(bytes) => cache.set(key, bytes, self.cache_ttl).await,
            Err(e) => warn!("Failed to encode cache entry {}: {}", key, e),
        }
    }
}

fn validate_document(id: &str, text: &str) -> AgriResult<()> {
    if id.trim().is_empty() {
        return Err(AgriError::validation("document id must not be empty"));
    }
    if text.trim().is_empty() {
        return Err(AgriError::validation(format!(
            "document '{}' has no text",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agri_common::{Location, Measurement, MeasurementValue};
    use std::collections::HashMap;

    fn reading(measurements: &[(&str, f64, &str)], crop: Option<&str>) -> SensorReading {
        SensorReading {
            id: "r1".into(),
            device_id: "soil_01".into(),
            timestamp: Default::default(),
            location: Location {
                latitude: 0.0,
                longitude: 0.0,
                field_id: "f1".into(),
                crop_type: crop.map(str::to_string),
            },
            measurements: measurements
                .iter()
                .map(|(k, v, unit)| {
                    (
                        k.to_string(),
                        Measurement {
                            value: MeasurementValue::Number(*v),
                            unit: unit.to_string(),
                            quality: None,
                        },
                    )
                })
                .collect::<HashMap<_, _>>(),
            device_status: Default::default(),
        }
    }

    #[test]
    fn test_augment_without_sensor_is_identity() {
        assert_eq!(augment_query("When to sow?", None), "When to sow?");
    }

    #[test]
    fn test_augment_full_context_in_fixed_order() {
        let r = reading(
            &[
                ("soil_temperature", 18.5, "°C"),
                ("soil_moisture", 20.0, "%"),
                ("humidity", 70.0, "%"),
            ],
            Some("potato"),
        );
        assert_eq!(
            augment_query("When should I water?", Some(&r)),
            "Field context: Location f1, Soil moisture: 20%, Soil temperature: 18.5°C, \
             Crop type: potato, Question: When should I water?"
        );
    }

    #[test]
    fn test_augment_skips_absent_fields() {
        let r = reading(&[("soil_temperature", 12.0, "°C")], None);
        assert_eq!(
            augment_query("Frost risk?", Some(&r)),
            "Field context: Location f1, Soil temperature: 12°C, Question: Frost risk?"
        );

        let empty_crop = reading(&[], Some(""));
        assert_eq!(
            augment_query("q", Some(&empty_crop)),
            "Field context: Location f1, Question: q"
        );
    }

    #[test]
    fn test_augment_is_deterministic() {
        let r = reading(
            &[("soil_moisture", 33.3, "%"), ("soil_temperature", 21.0, "°C")],
            Some("corn"),
        );
        let first = augment_query("q", Some(&r));
        for _ in 0..20 {
            assert_eq!(augment_query("q", Some(&r)), first);
        }
    }

    #[test]
    fn test_validate_document() {
        assert!(validate_document("id", "text").is_ok());
        assert!(validate_document(" ", "text").is_err());
        assert!(validate_document("id", "").is_err());
    }
}
