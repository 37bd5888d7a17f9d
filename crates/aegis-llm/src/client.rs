//! HTTP client for the language-model backend
//!
//! The backend contract is narrow: a prompt and a response schema go in, a
//! validated structured object comes out. Responses may be the schema object
//! itself, an envelope carrying JSON in `message.content`, or prose with a
//! fenced JSON block; all three are accepted in that order.

use aegis_common::config::LlmConfig;
use aegis_common::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One structured-completion request
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub schema: Value,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, schema: Value) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            schema,
        }
    }
}

/// Seam for the language-model backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Complete the request, returning the raw structured payload.
    async fn complete(&self, request: &LlmRequest) -> Result<Value>;
}

/// Backend implementation speaking the chat-completion HTTP contract
pub struct HttpLlmClient {
    client: Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent("aegis/0.4")
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmBackend for HttpLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<Value> {
        let payload = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "temperature": self.config.temperature,
            "format": request.schema,
            "stream": false,
        });

        debug!(endpoint = %self.config.endpoint, model = %self.config.model, "dispatching completion");

        let mut builder = self.client.post(&self.config.endpoint).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("LM call exceeded {}s", self.config.timeout_seconds))
            } else {
                Error::ExternalTool(format!("LM request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ExternalTool(format!(
                "LM backend returned {}: {}",
                status, body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Validation(format!("LM response is not JSON: {}", e)))?;

        extract_content(&body)
    }
}

/// Pull the structured object out of whatever envelope the backend used.
pub fn extract_content(body: &Value) -> Result<Value> {
    if let Some(content) = body
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return parse_content(content);
    }
    if let Some(content) = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return parse_content(content);
    }
    if body.is_object() {
        return Ok(body.clone());
    }
    Err(Error::Validation(format!(
        "LM response has no usable content: {}",
        body
    )))
}

fn parse_content(content: &str) -> Result<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }
    if let Some(block) = extract_fenced_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }
    Err(Error::Validation(format!(
        "LM content is not a JSON object: {}",
        truncate(trimmed, 200)
    )))
}

/// First fenced code block in `text`, with an optional `json` info string.
pub fn extract_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let after = after.trim_start_matches(['\r', '\n']);
    let end = after.find("```")?;
    Some(after[..end].trim().to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

/// Typed wrapper enforcing the response schema with one automatic retry
pub struct StructuredClient {
    backend: Arc<dyn LlmBackend>,
    max_retries: u32,
}

impl StructuredClient {
    pub fn new(backend: Arc<dyn LlmBackend>, max_retries: u32) -> Self {
        Self {
            backend,
            max_retries,
        }
    }

    pub fn backend(&self) -> Arc<dyn LlmBackend> {
        self.backend.clone()
    }

    /// Run the completion and deserialize into `T`. Malformed output and
    /// timeouts get one retry; the second failure propagates.
    pub async fn complete_structured<T: DeserializeOwned>(&self, request: &LlmRequest) -> Result<T> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match self.backend.complete(request).await {
                Ok(value) => match serde_json::from_value::<T>(value.clone()) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => {
                        warn!(attempt, error = %e, "LM output failed schema validation");
                        last_err = Some(Error::Validation(format!(
                            "schema validation failed: {}",
                            e
                        )));
                    }
                },
                Err(err @ (Error::Validation(_) | Error::Timeout(_))) => {
                    warn!(attempt, error = %err, "LM completion failed");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Validation("LM produced no output".to_string())))
    }
}
