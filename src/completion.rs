//! Chat-completion boundary.
//!
//! [`TextCompletionService`] is the only way the pipeline talks to a
//! language model: a system prompt and a user prompt go in, a JSON object
//! and token usage come out. Every model is checked against the priced
//! whitelist before a request is sent, so nothing unpriced is ever called.
//!
//! The OpenAI client does not retry on its own; transient failures surface
//! as [`UpstreamError`] and the job runner decides whether to try again.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use repo_compare_core::pricing::{self, TokenUsage};

use crate::config::LlmConfig;
use crate::error::UpstreamError;

const SERVICE: &str = "openai chat";

/// A parsed completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: serde_json::Value,
    pub usage: TokenUsage,
    /// Whitelisted model that was requested. Providers report dated
    /// snapshots (`gpt-4o-mini-2024-07-18`), which are not priced; this is
    /// the name the ledger records.
    pub model: String,
}

#[async_trait]
pub trait TextCompletionService: Send + Sync {
    /// Run one completion with a JSON-object response format.
    async fn complete(&self, system_prompt: &str, user_prompt: &str, model: &str)
        -> Result<Completion>;
}

pub fn create_completion_service(config: &LlmConfig) -> Result<Arc<dyn TextCompletionService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => Ok(Arc::new(OpenAiCompletion::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Fails every call. Used when `llm.provider = "disabled"`.
pub struct DisabledCompletion;

#[async_trait]
impl TextCompletionService for DisabledCompletion {
    async fn complete(&self, _system: &str, _user: &str, _model: &str) -> Result<Completion> {
        bail!("Text completion is disabled. Set [llm] provider = \"openai\" in config.")
    }
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

pub struct OpenAiCompletion {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompletion {
    /// Reads `OPENAI_API_KEY` once, here.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TextCompletionService for OpenAiCompletion {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
    ) -> Result<Completion> {
        pricing::ensure_supported(model)?;

        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status.as_u16(), retry_after, &body).into());
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e))?;

        let text = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| UpstreamError::Malformed {
                service: SERVICE,
                message: "response has no message content".to_string(),
            })?;
        let content = extract_json_object(&text)?;
        let usage = body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let served_by = body.model.unwrap_or_else(|| model.to_string());

        debug!(
            model,
            served_by = %served_by,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "completion finished"
        );

        Ok(Completion {
            content,
            usage,
            model: model.to_string(),
        })
    }
}

/// Parse a JSON object out of model output, tolerating surrounding prose
/// or a fenced code block.
pub fn extract_json_object(content: &str) -> Result<serde_json::Value> {
    let json_str = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => content,
    };
    let value: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| UpstreamError::Malformed {
            service: SERVICE,
            message: format!("content is not JSON: {}", e),
        })?;
    if !value.is_object() {
        return Err(UpstreamError::Malformed {
            service: SERVICE,
            message: "content is not a JSON object".to_string(),
        }
        .into());
    }
    Ok(value)
}
