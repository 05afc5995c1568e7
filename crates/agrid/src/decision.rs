//! Decision composer: retrieval -> prompt -> completion -> action tags.

use crate::context::CallContext;
use crate::knowledge::KnowledgeService;
use crate::llm_client::CompletionClient;
use agri_common::{ActionTag, AgriError, AgriResult, ChatMessage, DecisionResult, SensorReading};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

/// Advisor persona sent as the system turn
pub const SYSTEM_PROMPT: &str = "You are an expert agricultural advisor. Provide practical, \
    actionable recommendations based on sensor data and agricultural knowledge.";

const PROMPT_HEADER: &str = "You are an agricultural expert. Based on the following agricultural \
    knowledge and sensor data, provide recommendations:\n\n";

/// Confidence reported with every decision.
///
/// Scoring is not implemented; this is a fixed placeholder that callers may
/// later replace with a computed value.
pub const PLACEHOLDER_CONFIDENCE: f64 = 0.85;

/// Render the retrieved documents and the question into the user prompt
pub fn build_prompt(query: &str, documents: &[String]) -> String {
    let mut prompt = String::from(PROMPT_HEADER);
    for (i, doc) in documents.iter().enumerate() {
        let _ = write!(prompt, "Document {}: {}\n\n", i + 1, doc);
    }
    let _ = write!(
        prompt,
        "Question: {}\n\nProvide practical recommendations with specific actions.",
        query
    );
    prompt
}

/// Keyword-based action tags, in `ActionTag::ALL` order
pub fn extract_action_tags(text: &str) -> Vec<ActionTag> {
    let lower = text.to_lowercase();
    ActionTag::ALL
        .into_iter()
        .filter(|tag| tag.keywords().iter().any(|k| lower.contains(k)))
        .collect()
}

pub struct DecisionComposer {
    knowledge: Arc<KnowledgeService>,
    llm: Arc<dyn CompletionClient>,
}

impl DecisionComposer {
    pub fn new(knowledge: Arc<KnowledgeService>, llm: Arc<dyn CompletionClient>) -> Self {
        Self { knowledge, llm }
    }

    /// Answer `query` for a field. Enrichment comes from `sensor` only;
    /// `field_id` is carried for logging.
    pub async fn get_decision(
        &self,
        ctx: &CallContext,
        query: &str,
        field_id: Option<&str>,
        sensor: Option<&SensorReading>,
    ) -> AgriResult<DecisionResult> {
        if query.trim().is_empty() {
            return Err(AgriError::validation("query must not be empty"));
        }
        debug!(
            "Decision request for field {}",
            field_id.or(sensor.map(|s| s.field_id())).unwrap_or("-")
        );

        let documents = self.knowledge.search_knowledge(ctx, query, sensor).await?;
        let prompt = build_prompt(query, &documents);

        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let response = self.llm.chat(ctx, &messages, None).await?;
        let recommendation = response.message.content;

        let action_tags = extract_action_tags(&recommendation);
        info!(
            "Decision composed from {} documents, actions: {:?}",
            documents.len(),
            action_tags
        );

        Ok(DecisionResult {
            recommendation_text: recommendation,
            confidence_score: PLACEHOLDER_CONFIDENCE,
            source_documents: documents,
            action_tags,
        })
    }
}
