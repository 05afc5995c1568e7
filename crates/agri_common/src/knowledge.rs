//! Knowledge documents, search results and decision output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Payload key holding the document text
pub const CONTENT_FIELD: &str = "content";

/// String-valued point payload (numeric/bool metadata is stringified before storage)
pub type Payload = BTreeMap<String, String>;

/// A document in the knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Payload,
}

impl KnowledgeDocument {
    /// Payload stored alongside the vector: metadata plus the text under `content`
    pub fn payload(&self) -> Payload {
        let mut payload = self.metadata.clone();
        payload.insert(CONTENT_FIELD.to_string(), self.text.clone());
        payload
    }
}

/// One nearest-neighbor hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub score: f32,
    #[serde(default)]
    pub payload: Payload,
}

impl ScoredPoint {
    pub fn content(&self) -> Option<&str> {
        self.payload.get(CONTENT_FIELD).map(String::as_str)
    }
}

/// Hits ordered by descending score; empty means "no match", not an error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchResult(pub Vec<ScoredPoint>);

impl SearchResult {
    /// Sort descending by score and cap at `limit`
    pub fn ranked(mut points: Vec<ScoredPoint>, limit: usize) -> Self {
        points.sort_by(|a, b| b.score.total_cmp(&a.score));
        points.truncate(limit);
        Self(points)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredPoint> {
        self.0.iter()
    }

    /// Document texts in rank order; hits lacking a `content` field are skipped
    pub fn contents(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|p| p.content().map(str::to_string))
            .collect()
    }
}

// ============================================================================
// Decision output
// ============================================================================

/// Discrete action identifiers extracted from a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTag {
    IrrigationRecommended,
    FertilizationRecommended,
    PestControlRecommended,
    HarvestRecommended,
}

impl ActionTag {
    /// Fixed check order; extracted tags follow this order
    pub const ALL: [ActionTag; 4] = [
        ActionTag::IrrigationRecommended,
        ActionTag::FertilizationRecommended,
        ActionTag::PestControlRecommended,
        ActionTag::HarvestRecommended,
    ];

    /// Lower-case keywords that trigger this tag
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            ActionTag::IrrigationRecommended => &["irrigate", "water"],
            ActionTag::FertilizationRecommended => &["fertilize", "nutrient"],
            ActionTag::PestControlRecommended => &["pest", "spray"],
            ActionTag::HarvestRecommended => &["harvest"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::IrrigationRecommended => "irrigation_recommended",
            ActionTag::FertilizationRecommended => "fertilization_recommended",
            ActionTag::PestControlRecommended => "pest_control_recommended",
            ActionTag::HarvestRecommended => "harvest_recommended",
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured answer to a decision request. Built per request, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    #[serde(rename = "recommendation")]
    pub recommendation_text: String,
    #[serde(rename = "confidence")]
    pub confidence_score: f64,
    #[serde(rename = "sources")]
    pub source_documents: Vec<String>,
    #[serde(rename = "actions")]
    pub action_tags: Vec<ActionTag>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(score: f32, content: Option<&str>) -> ScoredPoint {
        let mut payload = Payload::new();
        if let Some(c) = content {
            payload.insert(CONTENT_FIELD.to_string(), c.to_string());
        }
        payload.insert("crop".to_string(), "potato".to_string());
        ScoredPoint { score, payload }
    }

    #[test]
    fn test_ranked_orders_and_truncates() {
        let result = SearchResult::ranked(
            vec![
                point(0.2, Some("c")),
                point(0.9, Some("a")),
                point(0.5, Some("b")),
            ],
            2,
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result.contents(), vec!["a", "b"]);
    }

    #[test]
    fn test_contents_skips_missing_field() {
        let result = SearchResult(vec![point(0.9, Some("a")), point(0.8, None), point(0.7, Some("c"))]);
        assert_eq!(result.contents(), vec!["a", "c"]);
    }

    #[test]
    fn test_document_payload_carries_content() {
        let doc = KnowledgeDocument {
            id: "potato-irrigation".into(),
            text: "Water potatoes when soil moisture drops below 30%.".into(),
            embedding: vec![],
            metadata: Payload::from([("crop".to_string(), "potato".to_string())]),
        };
        let payload = doc.payload();
        assert_eq!(payload.get(CONTENT_FIELD).map(String::as_str), Some(doc.text.as_str()));
        assert_eq!(payload.get("crop").map(String::as_str), Some("potato"));
    }

    #[test]
    fn test_decision_result_wire_names() {
        let result = DecisionResult {
            recommendation_text: "Irrigate".into(),
            confidence_score: 0.85,
            source_documents: vec!["doc".into()],
            action_tags: vec![ActionTag::IrrigationRecommended],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["recommendation"], "Irrigate");
        assert_eq!(json["actions"][0], "irrigation_recommended");
        assert_eq!(json["sources"][0], "doc");
    }
}
