//! Mock LLM client for development and tests.

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::LlmError;

use super::{ChatRequest, LlmClient, TokenStream};

/// Deterministic offline client: echoes the question inside a canned reply
/// and streams it in small pieces with a short pacing delay.
pub struct MockLlmClient;

impl MockLlmClient {
    pub fn new() -> Self {
        Self
    }

    fn render_response(request: &ChatRequest) -> String {
        let question = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let shown: String = question.chars().take(50).collect();
        let ellipsis = if question.chars().count() > 50 { "..." } else { "" };

        format!(
            "这是一个模拟的AI回答。\n\n您的问题是：「{shown}{ellipsis}」\n\n\
             根据提供的文档内容，以下是相关信息：\n\n\
             1. 文档中提到了相关的概念和定义。\n\
             2. 具体的实现细节可以参考文档的详细说明。\n\
             3. 如需更多信息，建议查阅完整文档。\n\n\
             【注意】这是开发模式下的模拟响应，请配置真实的LLM API以获取准确答案。"
        )
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn kind(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> String {
        "mock-model".to_string()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        Ok(Self::render_response(request))
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let response = Self::render_response(request);
        let pieces: Vec<String> = response.chars().map(|c| c.to_string()).collect();

        let stream = futures::stream::iter(pieces.into_iter().map(Ok)).then(|item| async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            item
        });
        Ok(stream.boxed())
    }
}
