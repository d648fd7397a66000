//! `LlmAdapter`: the boundary between the Agent Loop and a model provider.
//!
//! Grounded on `machi::providers::common::Model`/`ModelResponse`, narrowed to
//! what the Agent Loop actually needs (a streamed `{Token, ToolCall, Done}`
//! sequence) and decoupled from `machi`'s message/chat types so any provider
//! can be adapted without pulling in the rest of the teacher's chat stack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::RunMessage;

/// One proposed tool call returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedToolCall {
    /// Correlates this call with its eventual result.
    pub tool_call_id: crate::ids::ToolCallId,
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Arguments, as parsed JSON.
    pub args: Value,
}

/// A chunk streamed back from [`LlmAdapter::generate_stream`].
#[derive(Debug, Clone)]
pub enum LlmChunk {
    /// A partial piece of the model's text output.
    Token(String),
    /// The model proposed one or more tool calls.
    ToolCalls(Vec<ProposedToolCall>),
    /// Generation finished; carries final token usage.
    Done {
        /// Prompt tokens consumed.
        prompt_tokens: u64,
        /// Completion tokens produced.
        completion_tokens: u64,
    },
}

/// The model call this crate depends on, decoupled from any concrete
/// provider SDK. Implementations adapt a specific vendor API to this shape.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Identifies the model for logging and `llm.called` events.
    fn model_id(&self) -> &str;

    /// Run one completion over `messages` with `tools` available, returning
    /// the fully materialized chunk sequence (token deltas followed by
    /// either `ToolCalls` or a final text `Done`).
    ///
    /// Streaming to the caller is handled by the Agent Loop, which forwards
    /// `Token` chunks into `llm.token` events as they arrive; this method
    /// signature allows true streaming providers and batch ones alike to
    /// implement it uniformly.
    ///
    /// # Errors
    /// Returns `AGENT_ERROR` if the underlying call fails.
    async fn generate_stream(
        &self,
        messages: &[RunMessage],
        tools: &[crate::tool::ToolDefinition],
    ) -> Result<Vec<LlmChunk>>;
}

/// A scripted [`LlmAdapter`] for tests, grounded on
/// `machi::providers::mock::MockModel`'s response-cycling behavior.
#[derive(Debug)]
pub struct MockLlmAdapter {
    model_id: String,
    responses: Vec<Vec<LlmChunk>>,
    next: std::sync::atomic::AtomicUsize,
}

impl MockLlmAdapter {
    /// Build a mock adapter that cycles through `responses` in order,
    /// wrapping back to the first once exhausted.
    #[must_use]
    pub fn new(responses: Vec<Vec<LlmChunk>>) -> Self {
        Self {
            model_id: "mock-llm".to_string(),
            responses,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Override the reported model id.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}

#[async_trait]
impl LlmAdapter for MockLlmAdapter {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate_stream(
        &self,
        _messages: &[RunMessage],
        _tools: &[crate::tool::ToolDefinition],
    ) -> Result<Vec<LlmChunk>> {
        let index = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self
            .responses
            .get(index % self.responses.len().max(1))
            .cloned()
            .unwrap_or_else(|| {
                vec![LlmChunk::Done {
                    prompt_tokens: 0,
                    completion_tokens: 0,
                }]
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cycles_through_scripted_responses() {
        let adapter = MockLlmAdapter::new(vec![
            vec![LlmChunk::Token("first".into())],
            vec![LlmChunk::Token("second".into())],
        ]);

        let r1 = adapter.generate_stream(&[], &[]).await.unwrap();
        assert!(matches!(&r1[0], LlmChunk::Token(t) if t == "first"));

        let r2 = adapter.generate_stream(&[], &[]).await.unwrap();
        assert!(matches!(&r2[0], LlmChunk::Token(t) if t == "second"));

        let r3 = adapter.generate_stream(&[], &[]).await.unwrap();
        assert!(matches!(&r3[0], LlmChunk::Token(t) if t == "first"));
    }

    #[test]
    fn custom_model_id_is_reported() {
        let adapter = MockLlmAdapter::new(vec![]).with_model_id("claude-mock");
        assert_eq!(adapter.model_id(), "claude-mock");
    }
}
