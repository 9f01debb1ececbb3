//! LLM collaborator: a prompt-in / text-out completion service.

use crate::config::LlmConfig;
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str =
    "You are a precise JSON-only responder. Always return valid JSON, no other text.";

/// Anything that can complete a prompt. May fail or hang; callers bound it
/// with their own timeouts.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self::with_timeout(api_key, model, base_url, LlmConfig::default().timeout())
    }

    pub fn with_timeout(api_key: String, model: String, base_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
            http,
        }
    }

    /// `None` when no usable API key is configured.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        if !config.enabled || !config.has_credentials() {
            return None;
        }
        let api_key = config.api_key.clone()?;
        Some(Self::with_timeout(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            config.timeout(),
        ))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() || self.api_key == crate::config::DUMMY_API_KEY {
            return Err(NlqError::LlmUnavailable("no API key configured".to_string()));
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
            "max_tokens": 1000
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("LLM API call failed: {}", e);
                if e.is_timeout() {
                    NlqError::LlmUnavailable("request timed out".to_string())
                } else {
                    NlqError::LlmUnavailable("request failed".to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("LLM API returned status {}", status);
            return Err(NlqError::LlmUnavailable(format!("status {}", status)));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            warn!("Failed to parse LLM response: {}", e);
            NlqError::LlmUnavailable("unreadable response".to_string())
        })?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::LlmUnavailable("no content in response".to_string()))?;
        debug!("LLM returned {} chars", content.len());

        Ok(content.to_string())
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.call_llm(prompt).await
    }
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// The outermost `{...}` object in a response, tolerating chatter around it.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let content = strip_code_fences(content);
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}
