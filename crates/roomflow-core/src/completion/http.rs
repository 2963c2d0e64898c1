//! HTTP completion client for Anthropic-compatible (`/v1/messages`) and
//! OpenAI-compatible (`/chat/completions`) endpoints.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{CompletionClient, CompletionError, CompletionRequest, CompletionResponse};
use crate::config::AssistantConfig;

pub struct HttpCompletionClient {
    client: reqwest::Client,
    config: AssistantConfig,
}

impl HttpCompletionClient {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
        }
    }

    /// POST {base_url}/v1/messages
    async fn call_anthropic(&self, request: &CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "metadata": { "user_id": request.user_id },
            "messages": [
                { "role": "user", "content": request.user_prompt }
            ]
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = Value::String(system.clone());
        }

        tracing::info!(
            "[CompletionClient] Calling Anthropic API: {} (model: {}, session: {})",
            url,
            self.config.model,
            request.session_id
        );

        let json = self
            .post(&url, body, |rb| {
                rb.header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", "2023-06-01")
            })
            .await?;

        let content = json
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|arr| {
                arr.iter()
                    .filter_map(|block| {
                        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                            block.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .reduce(|a, b| format!("{}\n{}", a, b))
            })
            .ok_or_else(|| CompletionError::Decode("response has no text content".to_string()))?;

        let completed = json.get("stop_reason").and_then(|s| s.as_str()) != Some("max_tokens");
        Ok(CompletionResponse { content, completed })
    }

    /// POST {base_url}/chat/completions
    async fn call_openai(&self, request: &CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut messages = vec![];
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.user_prompt }));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "user": request.user_id,
        });

        tracing::info!(
            "[CompletionClient] Calling chat completions API: {} (model: {}, session: {})",
            url,
            self.config.model,
            request.session_id
        );

        let json = self
            .post(&url, body, |rb| {
                rb.header("Authorization", format!("Bearer {}", self.config.api_key))
            })
            .await?;

        let choice = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| CompletionError::Decode("response has no choices".to_string()))?;
        let content = choice
            .get("message")
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let completed = choice.get("finish_reason").and_then(|f| f.as_str()) != Some("length");
        Ok(CompletionResponse { content, completed })
    }

    async fn post<F>(&self, url: &str, body: Value, auth: F) -> Result<Value, CompletionError>
    where
        F: FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        let response = auth(self.client.post(url))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::Transport(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            tracing::warn!("[CompletionClient] {} returned {}", url, status);
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| CompletionError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        match self.config.adapter.as_str() {
            "anthropic" | "claude-code-sdk" => self.call_anthropic(&request).await,
            "openai" | "opencode" => self.call_openai(&request).await,
            other => Err(CompletionError::Transport(format!(
                "Unknown adapter type: '{}'",
                other
            ))),
        }
    }
}
