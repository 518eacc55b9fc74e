//! Inference backend abstraction.
//!
//! The orchestrator only knows this trait; the concrete client speaks the
//! OpenAI-compatible chat API that llama-server exposes. Tests substitute a
//! scripted backend.

pub mod client;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LlmError;
use crate::store::types::GenerationMetric;

pub use client::LlamaServerClient;

/// One turn in the chat transcript sent to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant", content: content.into() }
    }
}

/// A single generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    /// Sampling parameters (temperature and friends), merged into the
    /// request body verbatim. Comes from the prompt dictionary.
    pub params: serde_json::Value,
    pub max_tokens: i64,
}

/// What came back: the answer, the model's visible reasoning if it produced
/// any, and a metric row ready for persistence (caller fills in the step and
/// prompt links).
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub reasoning: Option<String>,
    pub metric: GenerationMetric,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, LlmError>;
}
