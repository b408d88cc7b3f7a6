//! Responses-API client (Azure OpenAI new-style deployments).
//!
//! The wire format differs from chat completions: the request carries a
//! flattened `input` string plus `instructions` instead of a messages array,
//! replies arrive under `output[0].content[0].text`, and streamed events
//! carry a bare `delta` field until `response.completed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::LlmError;

use super::{sse_data, spawn_sse_pump, ChatRequest, LlmClient, SseFrame, TokenStream};

/// Client for the Responses API.
pub struct ResponsesClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    default_max_tokens: u32,
    available: AtomicBool,
}

impl ResponsesClient {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        if config.api_key.is_empty() || config.endpoint.is_empty() {
            anyhow::bail!("llm api_key and endpoint are required for the responses api");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_millis(config.timeout))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build LLM HTTP client: {e}"))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            default_max_tokens: config.max_tokens,
            available: AtomicBool::new(true),
        })
    }

    /// Flatten the conversation into the `input` string: user turns verbatim,
    /// assistant turns tagged so the model can tell them apart.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let model = request
            .model_override
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.model);

        let mut input = String::new();
        for msg in &request.messages {
            match msg.role.as_str() {
                "user" => {
                    input.push_str(&msg.content);
                    input.push('\n');
                }
                "assistant" => {
                    input.push_str("[助手回复]: ");
                    input.push_str(&msg.content);
                    input.push('\n');
                }
                _ => {
                    input.push_str(&msg.content);
                    input.push('\n');
                }
            }
        }

        let mut body = json!({
            "model": model,
            "stream": stream,
            "max_output_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
            "input": input.trim(),
        });
        if let Some(system) = request
            .system_prompt
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            body["instructions"] = json!(system);
        }
        body
    }

    fn parse_sse_line(line: &str) -> Option<SseFrame> {
        let data = sse_data(line)?;
        if data == "[DONE]" {
            return Some(SseFrame::Done);
        }
        let parsed: Value = serde_json::from_str(data).ok()?;

        if parsed.get("type").and_then(|t| t.as_str()) == Some("response.completed") {
            return Some(SseFrame::Done);
        }
        if let Some(delta) = parsed.get("delta").and_then(|d| d.as_str()) {
            return Some(SseFrame::Delta(delta.to_string()));
        }
        // some event shapes repeat the accumulated text under output[]
        parsed
            .pointer("/output/0/content/0/text")
            .and_then(|t| t.as_str())
            .map(|t| SseFrame::Delta(t.to_string()))
    }

    fn parse_content(body: &Value) -> Result<String, LlmError> {
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            return Err(LlmError::Service(format!("API error: {message}")));
        }
        Ok(body
            .pointer("/output/0/content/0/text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl LlmClient for ResponsesClient {
    fn kind(&self) -> &str {
        "azure"
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let body = self.build_body(request, false);
        let response = self
            .client
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::from_transport)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Service(format!("invalid responses JSON: {e}")))?;
        Self::parse_content(&parsed)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let body = self.build_body(request, true);
        let response = self
            .client
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .json(&body)
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
    use crate::llm::ChatMessage;

    fn config() -> ModelConfig {
        ModelConfig {
            kind: "azure".into(),
            api_type: "responses".into(),
            api_key: "test-key".into(),
            model: "gpt-5.1".into(),
            endpoint: "https://example.openai.azure.com/openai/responses".into(),
            ..Default::default()
        }
    }

    #[test]
    fn body_flattens_conversation() {
        let client = ResponsesClient::new(&config()).unwrap();
        let request = ChatRequest {
            system_prompt: Some("ground your answers".into()),
            messages: vec![
                ChatMessage::user("first question"),
                ChatMessage::new("assistant", "first answer"),
                ChatMessage::user("second question"),
            ],
            max_tokens: None,
            temperature: None,
            model_override: None,
        };
        let body = client.build_body(&request, true);
        let input = body["input"].as_str().unwrap();
        assert!(input.starts_with("first question"));
        assert!(input.contains("[助手回复]: first answer"));
        assert!(input.ends_with("second question"));
        assert_eq!(body["instructions"], "ground your answers");
        assert_eq!(body["max_output_tokens"], 2048);
    }

    #[test]
    fn parses_output_content() {
        let body = serde_json::json!({
            "output": [ { "content": [ { "text": "answer text" } ] } ]
        });
        assert_eq!(ResponsesClient::parse_content(&body).unwrap(), "answer text");
    }

    #[test]
    fn error_body_becomes_service_error() {
        let body = serde_json::json!({ "error": { "message": "deployment gone" } });
        assert!(matches!(
            ResponsesClient::parse_content(&body),
            Err(LlmError::Service(_))
        ));
    }

    #[test]
    fn stream_line_parsing() {
        assert!(matches!(
            ResponsesClient::parse_sse_line(r#"data: {"type":"response.output_text.delta","delta":"Hi"}"#),
            Some(SseFrame::Delta(d)) if d == "Hi"
        ));
        assert!(matches!(
            ResponsesClient::parse_sse_line(r#"data: {"type":"response.completed"}"#),
            Some(SseFrame::Done)
        ));
        assert!(matches!(
            ResponsesClient::parse_sse_line("data: [DONE]"),
            Some(SseFrame::Done)
        ));
    }
}
