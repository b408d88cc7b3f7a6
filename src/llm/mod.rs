//! LLM client abstraction, wire types, and streaming plumbing.
//!
//! A [`LlmClient`] speaks to one chat model. Streaming answers are modelled
//! as a pull-based [`TokenStream`]: zero or more non-empty text deltas in
//! provider order, ending either normally (stream closes after the terminal
//! sentinel) or with one [`LlmError`](crate::error::LlmError) item.
//!
//! | Config `type` | `api_type` | Client |
//! |---------------|-----------|--------|
//! | `mock` | — | [`mock::MockLlmClient`] |
//! | `openai` / `dashscope` / `azure` | `chat` | [`openai::ChatCompletionsClient`] |
//! | `azure` (or any) | `responses` | [`responses::ResponsesClient`] |

pub mod mock;
pub mod openai;
pub mod responses;
pub mod router;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{ModelConfig, RetryConfig};
use crate::error::LlmError;

/// One conversation turn on the wire (`system` / `user` / `assistant`).
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// A chat request; unset knobs defer to the client's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// `None` means "use the configured maximum".
    pub max_tokens: Option<u32>,
    /// `None` means "use the default temperature" (0.7).
    pub temperature: Option<f32>,
    pub model_override: Option<String>,
}

impl ChatRequest {
    /// Single-shot request with one user message.
    pub fn single(prompt: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            system_prompt: None,
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
            model_override: None,
        }
    }
}

/// Ordered text deltas with an explicit error terminal.
pub type TokenStream = BoxStream<'static, Result<String, LlmError>>;

/// Trait implemented by every chat backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Stable client identifier used by router dispatch.
    fn kind(&self) -> &str;

    /// Configured model name, for logs and fallback warnings.
    fn model_name(&self) -> String;

    /// Cheap health signal; routing prefers available clients.
    fn is_available(&self) -> bool {
        true
    }

    /// Blocking completion: the full reply as one string.
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError>;

    /// Streaming completion. The returned stream yields deltas in provider
    /// order and closes after the provider's terminal sentinel.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError>;
}

/// Build a client from one model configuration block.
pub fn build_client(
    config: &ModelConfig,
    retry: &RetryConfig,
) -> anyhow::Result<Arc<dyn LlmClient>> {
    if !config.is_enabled() {
        anyhow::bail!("model type must be configured");
    }
    match (config.kind.as_str(), config.api_type.as_str()) {
        ("mock", _) => Ok(Arc::new(mock::MockLlmClient::new())),
        (_, "responses") => Ok(Arc::new(responses::ResponsesClient::new(config)?)),
        (_, "chat") => Ok(Arc::new(openai::ChatCompletionsClient::new(
            config,
            retry.clone(),
        )?)),
        (_, other) => anyhow::bail!("Unknown llm api_type: '{}'. Use chat or responses.", other),
    }
}

// ============ SSE plumbing ============

/// Parsed meaning of one SSE data line.
pub(crate) enum SseFrame {
    Delta(String),
    Done,
}

/// Read an SSE body into a bounded channel of text deltas.
///
/// The reader task parses line-by-line as bytes arrive and stops on the
/// terminal frame, a transport error (forwarded as the final stream item),
/// or when the consumer drops the stream. The channel is bounded, so
/// provider reads only proceed while the consumer keeps accepting.
pub(crate) fn spawn_sse_pump<F>(response: reqwest::Response, parse: F) -> TokenStream
where
    F: Fn(&str) -> Option<SseFrame> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<String, LlmError>>(32);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(next) = body.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx.send(Err(LlmError::from_transport(e))).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                match parse(&line) {
                    Some(SseFrame::Done) => return,
                    Some(SseFrame::Delta(delta)) if !delta.is_empty() => {
                        if tx.send(Ok(delta)).await.is_err() {
                            // consumer cancelled; drop the connection
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }
        // provider closed the connection without a sentinel: complete
    });

    ReceiverStream::new(rx).boxed()
}

/// Strip the `data: ` prefix from an SSE line.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}
