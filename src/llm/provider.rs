//! LLM Provider trait — common interface for all LLM backends.

use crate::error::LlmError;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

// ── Common Parameters ──────────────────────────────────
#[derive(Debug, Clone, Default)]
pub struct LlmParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    /// Request `response_format: json_object`. Required for extraction,
    /// consolidation and evolution calls.
    pub json_mode: bool,
}

impl LlmParams {
    pub fn json() -> Self {
        Self {
            json_mode: true,
            ..Self::default()
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Common interface for LLM providers (OpenAI-compatible endpoints, etc.)
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Non-streaming chat completion.
    async fn chat(&self, messages: Vec<Message>, options: Option<LlmParams>)
        -> Result<String, LlmError>;

    /// Streaming chat completion — yields content deltas.
    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        options: Option<LlmParams>,
    ) -> Result<TokenStream, LlmError>;

    /// Provider identifier (e.g. "openai", "free_tier").
    fn id(&self) -> &str;
}
