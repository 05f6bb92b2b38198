//! Embedding backends for the category resolver.
//!
//! | Provider | Description |
//! |----------|-------------|
//! | `disabled` | No backend; the semantic layer always misses. |
//! | `openai` | `POST {base_url}/embeddings` with `OPENAI_API_KEY`. |
//!
//! The OpenAI client retries rate limits, server errors, and network
//! failures with exponential backoff (1s, 2s, 4s, … capped at 32s) up to
//! `embedding.max_retries` times. Client errors fail immediately.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use repo_compare_core::embedding::EmbeddingService;

use crate::config::EmbeddingConfig;
use crate::error::UpstreamError;

const SERVICE: &str = "openai embeddings";

/// Build the configured embedding backend, or `None` when disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingService>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config)?))),
        other => Err(anyhow!("Unknown embedding provider: {}", other)),
    }
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// Reads `OPENAI_API_KEY` once, here.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| UpstreamError::from_reqwest(SERVICE, &e))?;
                        return parse_embedding_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = UpstreamError::from_status(SERVICE, status.as_u16(), None, &body_text);
                    if !err.is_transient() {
                        return Err(err.into());
                    }
                    last_err = Some(err);
                }
                Err(e) => {
                    last_err = Some(UpstreamError::from_reqwest(SERVICE, &e));
                }
            }
        }

        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }
}

/// Extract `data[0].embedding` from an embeddings response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| UpstreamError::Malformed {
            service: SERVICE,
            message: "missing data[0].embedding".to_string(),
        })?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}
