//! llama-server chat client.
//!
//! Talks to the `/v1/chat/completions` endpoint. llama-server extends the
//! OpenAI response shape with a `timings` block and, for reasoning models, a
//! `reasoning_content` field on the message; older builds inline the
//! reasoning as a `<think>` block in the content instead, so both forms are
//! handled.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{GenerationOutcome, GenerationRequest, InferenceBackend};
use crate::store::types::GenerationMetric;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>(.*?)</think>").unwrap());

pub struct LlamaServerClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    n_ctx: i64,
    timeout_secs: u64,
}

impl LlamaServerClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            n_ctx: config.n_ctx,
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn build_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if let (Some(body_map), Some(params)) = (body.as_object_mut(), request.params.as_object())
        {
            for (key, value) in params {
                body_map.insert(key.clone(), value.clone());
            }
        }
        body
    }
}

#[async_trait]
impl InferenceBackend for LlamaServerClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(&request);
        debug!(url = %url, messages = request.messages.len(), "Sending chat completion request");

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let net_latency = started.elapsed().as_secs_f64();

        if !status.is_success() {
            return Err(LlmError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response had no choices".to_string()))?;

        let (answer, reasoning) = split_reasoning(choice.message.content, choice.message.reasoning_content);

        let timings = parsed.timings.unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default();
        let response_secs = (timings.prompt_ms
            + timings.predicted_n as f64 * timings.predicted_per_token_ms)
            / 1000.0;

        let metric = GenerationMetric {
            host: self.base_url.clone(),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            params: request.params,
            cache_tokens: timings.cache_n,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            host_ctx: self.n_ctx,
            prompt_ms: timings.prompt_ms,
            prompt_per_token_ms: timings.prompt_per_token_ms,
            prompt_per_second: timings.prompt_per_second,
            predicted_per_second: timings.predicted_per_second,
            response_secs,
            net_latency_secs: net_latency - response_secs.min(net_latency),
            total_secs: net_latency,
            ..GenerationMetric::default()
        };

        Ok(GenerationOutcome {
            text: answer,
            reasoning,
            metric,
        })
    }
}

/// Separate the model's reasoning from its answer. Prefers the explicit
/// `reasoning_content` field; otherwise extracts an inline `<think>` block.
fn split_reasoning(
    content: String,
    reasoning_content: Option<String>,
) -> (String, Option<String>) {
    if let Some(reasoning) = reasoning_content {
        let reasoning = reasoning.trim().to_string();
        let reasoning = (!reasoning.is_empty()).then_some(reasoning);
        return (content.trim().to_string(), reasoning);
    }
    if let Some(caps) = THINK_BLOCK.captures(&content) {
        let reasoning = caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        let answer = THINK_BLOCK.replace_all(&content, "").trim().to_string();
        return (answer, reasoning);
    }
    (content.trim().to_string(), None)
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    timings: Option<Timings>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

/// llama-server's non-standard performance block.
#[derive(Debug, Default, Deserialize)]
struct Timings {
    #[serde(default)]
    cache_n: i64,
    #[serde(default)]
    prompt_ms: f64,
    #[serde(default)]
    prompt_per_token_ms: f64,
    #[serde(default)]
    prompt_per_second: f64,
    #[serde(default)]
    predicted_n: i64,
    #[serde(default)]
    predicted_per_token_ms: f64,
    #[serde(default)]
    predicted_per_second: f64,
}
