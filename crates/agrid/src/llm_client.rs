//! Completion client for an Ollama-compatible `/api/chat` endpoint.
//!
//! Requests are always non-streaming. Non-200 responses and undecodable bodies
//! are upstream errors; nothing is retried here.

use crate::config::LlmConfig;
use crate::context::CallContext;
use crate::http::{build_client, expect_json, transport_error};
use crate::metrics::Observer;
use agri_common::{AgriResult, ChatMessage, ChatRequest, CompletionResponse, Stage, Tool};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send the full message sequence, return the assistant reply
    async fn chat(
        &self,
        ctx: &CallContext,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> AgriResult<CompletionResponse>;

    /// Single user-turn convenience; returns only the reply text
    async fn generate(&self, ctx: &CallContext, prompt: &str) -> AgriResult<String> {
        let messages = [ChatMessage::user(prompt)];
        let response = self.chat(ctx, &messages, None).await?;
        Ok(response.message.content)
    }
}

/// Ollama LLM client
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    observer: Arc<dyn Observer>,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig, observer: Arc<dyn Observer>) -> Result<Self> {
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

    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> AgriResult<CompletionResponse> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            tools,
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Stage::Completion, e))?;

        expect_json(Stage::Completion, response).await
    }
}

#[async_trait]
impl CompletionClient for OllamaClient {
    async fn chat(
        &self,
        ctx: &CallContext,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> AgriResult<CompletionResponse> {
        debug!(
            "Chat request to {} ({} messages)",
            self.model,
            messages.len()
        );
        let start = Instant::now();
        let result = ctx.run(Stage::Completion, self.send(messages, tools)).await;
        self.observer.llm_request(start.elapsed());
        result
    }
}
