//! Chat Completions client.
//!
//! Covers every provider speaking the OpenAI chat-completions wire format:
//! OpenAI itself, Azure OpenAI chat deployments (`api-key` header), and
//! DashScope's compatible mode. Streaming uses SSE with `delta.content`
//! fragments and the `[DONE]` sentinel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{ModelConfig, RetryConfig};
use crate::error::LlmError;

use super::{sse_data, spawn_sse_pump, ChatRequest, LlmClient, SseFrame, TokenStream};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const DASHSCOPE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";

/// How credentials travel to the provider.
enum AuthStyle {
    Bearer,
    ApiKey,
}

/// OpenAI-compatible chat client.
pub struct ChatCompletionsClient {
    kind: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    auth: AuthStyle,
    model: String,
    default_max_tokens: u32,
    retry: RetryConfig,
    available: AtomicBool,
}

impl ChatCompletionsClient {
    pub fn new(config: &ModelConfig, retry: RetryConfig) -> anyhow::Result<Self> {
        if config.api_key.is_empty() {
            anyhow::bail!("llm api_key is required for provider '{}'", config.kind);
        }

        let (endpoint, auth) = match config.kind.as_str() {
            "azure" => {
                if config.endpoint.is_empty() {
                    anyhow::bail!("llm endpoint is required for the azure provider");
                }
                let mut url = config.endpoint.clone();
                if !config.api_version.is_empty() && !url.contains("api-version=") {
                    let sep = if url.contains('?') { '&' } else { '?' };
                    url = format!("{url}{sep}api-version={}", config.api_version);
                }
                (url, AuthStyle::ApiKey)
            }
            "dashscope" => (
                if config.endpoint.is_empty() {
                    DASHSCOPE_URL.to_string()
                } else {
                    config.endpoint.clone()
                },
                AuthStyle::Bearer,
            ),
            _ => (
                if config.endpoint.is_empty() {
                    OPENAI_URL.to_string()
                } else {
                    config.endpoint.clone()
                },
                AuthStyle::Bearer,
            ),
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_millis(config.timeout))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build LLM HTTP client: {e}"))?;

        Ok(Self {
            kind: config.kind.clone(),
            client,
            endpoint,
            api_key: config.api_key.clone(),
            auth,
            model: config.model.clone(),
            default_max_tokens: config.max_tokens,
            retry,
            available: AtomicBool::new(true),
        })
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let model = request
            .model_override
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.model);

        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request
            .system_prompt
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in &request.messages {
            messages.push(json!({ "role": msg.role, "content": msg.content }));
        }

        json!({
            "model": model,
            "stream": stream,
            "max_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
            "temperature": request.temperature.unwrap_or(0.7),
            "messages": messages,
        })
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let builder = self.client.post(&self.endpoint).json(body);
        match self.auth {
            AuthStyle::Bearer => builder.header("Authorization", format!("Bearer {}", self.api_key)),
            AuthStyle::ApiKey => builder.header("api-key", &self.api_key),
        }
    }

    async fn chat_once(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let body = self.build_body(request, false);
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(LlmError::from_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::from_transport)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Service(format!("invalid completion JSON: {e}")))?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::Service("completion response had no content".into()))
    }

    /// Parse one chat-completions SSE line.
    fn parse_sse_line(line: &str) -> Option<SseFrame> {
        let data = sse_data(line)?;
        if data == "[DONE]" {
            return Some(SseFrame::Done);
        }
        let parsed: Value = serde_json::from_str(data).ok()?;
        let delta = parsed
            .pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())?;
        Some(SseFrame::Delta(delta.to_string()))
    }
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut delay = Duration::from_millis(self.retry.delay_ms);
        let mut last_err = None;

        for attempt in 0..self.retry.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = Duration::from_millis(
                    (delay.as_millis() as f64 * self.retry.multiplier) as u64,
                );
            }
            match self.chat_once(request).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "chat attempt failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| LlmError::Service("chat retries exhausted".into())))
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let body = self.build_body(request, true);
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(LlmError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            self.available.store(false, Ordering::Relaxed);
            return Err(LlmError::from_status(status, &text));
        }

        self.available.store(true, Ordering::Relaxed);
        Ok(spawn_sse_pump(response, Self::parse_sse_line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str) -> ModelConfig {
        ModelConfig {
            kind: kind.to_string(),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            endpoint: if kind == "azure" {
                "https://example.openai.azure.com/openai/deployments/d/chat/completions".to_string()
            } else {
                String::new()
            },
            api_version: if kind == "azure" {
                "2024-06-01".to_string()
            } else {
                String::new()
            },
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_resolution_per_kind() {
        let openai = ChatCompletionsClient::new(&config("openai"), RetryConfig::default()).unwrap();
        assert_eq!(openai.endpoint, OPENAI_URL);

        let dashscope =
            ChatCompletionsClient::new(&config("dashscope"), RetryConfig::default()).unwrap();
        assert_eq!(dashscope.endpoint, DASHSCOPE_URL);

        let azure = ChatCompletionsClient::new(&config("azure"), RetryConfig::default()).unwrap();
        assert!(azure.endpoint.contains("api-version=2024-06-01"));
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let mut cfg = config("openai");
        cfg.api_key = String::new();
        assert!(ChatCompletionsClient::new(&cfg, RetryConfig::default()).is_err());
    }

    #[test]
    fn body_places_system_prompt_first() {
        let client = ChatCompletionsClient::new(&config("openai"), RetryConfig::default()).unwrap();
        let request = ChatRequest {
            system_prompt: Some("be brief".into()),
            messages: vec![super::super::ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
            model_override: None,
        };
        let body = client.build_body(&request, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn model_override_wins() {
        let client = ChatCompletionsClient::new(&config("openai"), RetryConfig::default()).unwrap();
        let mut request = ChatRequest::single("hi", 50, 0.2);
        request.model_override = Some("other-model".into());
        let body = client.build_body(&request, true);
        assert_eq!(body["model"], "other-model");
        assert_eq!(body["max_tokens"], 50);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn sse_line_parsing() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        match ChatCompletionsClient::parse_sse_line(line) {
            Some(SseFrame::Delta(d)) => assert_eq!(d, "Hel"),
            _ => panic!("expected delta"),
        }
        assert!(matches!(
            ChatCompletionsClient::parse_sse_line("data: [DONE]"),
            Some(SseFrame::Done)
        ));
        assert!(ChatCompletionsClient::parse_sse_line("event: ping").is_none());
        assert!(ChatCompletionsClient::parse_sse_line(r#"data: {"choices":[{}]}"#).is_none());
    }
}
