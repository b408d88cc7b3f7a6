//! Contextual enrichment: LLM-generated locator prefixes per chunk.
//!
//! Before indexing, each chunk can be prefixed with a one-sentence note
//! describing where it sits in the document. The prefix feeds embedding and
//! BM25 only; displayed content and citations stay untouched. Any single
//! failure leaves that chunk's prefix empty — enrichment is never fatal to
//! ingestion.

use std::sync::Arc;

use crate::llm::router::LlmRouter;
use crate::llm::{ChatMessage, ChatRequest};
use crate::models::DocumentChunk;

/// Character window of the document shown to the model.
const DOCUMENT_WINDOW_CHARS: usize = 6000;
/// Pause between per-chunk calls to stay under provider rate limits.
const PACING_DELAY_MS: u64 = 100;

const CONTEXT_SYSTEM_PROMPT: &str =
    "你是一个专业的文档分析助手。你的任务是为文档片段生成简短的上下文说明，帮助理解该片段在整个文档中的位置和背景。";

/// Generates locator prefixes through the routed LLM.
pub struct ContextualEnricher {
    router: Arc<LlmRouter>,
}

impl ContextualEnricher {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        Self { router }
    }

    /// Enrich chunks in place; returns how many prefixes were generated.
    pub async fn enrich_chunks(&self, full_text: &str, chunks: &mut [DocumentChunk]) -> usize {
        tracing::info!(chunks = chunks.len(), "contextual enrichment started");
        let mut succeeded = 0usize;

        for chunk in chunks.iter_mut() {
            if let Some(prefix) = self.enrich_chunk(full_text, &chunk.content).await {
                chunk.context_prefix = Some(prefix);
                succeeded += 1;
            }
            tokio::time::sleep(std::time::Duration::from_millis(PACING_DELAY_MS)).await;
        }

        tracing::info!(
            succeeded,
            total = chunks.len(),
            "contextual enrichment finished"
        );
        succeeded
    }

    /// Ask the model for one locator sentence; `None` on any failure.
    pub async fn enrich_chunk(&self, full_text: &str, chunk_content: &str) -> Option<String> {
        let window = truncate_document(full_text, DOCUMENT_WINDOW_CHARS);
        let user_prompt = format!(
            "<document>\n{window}\n</document>\n\n以下是需要定位上下文的文档片段：\n<chunk>\n{chunk_content}\n</chunk>\n\n\
             请为这个片段生成一句简短的上下文说明（不超过50字），说明它在文档中的位置和主题。只输出上下文说明，不要输出其他内容。"
        );

        let request = ChatRequest {
            system_prompt: Some(CONTEXT_SYSTEM_PROMPT.to_string()),
            messages: vec![ChatMessage::user(user_prompt)],
            max_tokens: Some(100),
            temperature: Some(0.2),
            model_override: None,
        };

        match self.router.get_client(None).chat(&request).await {
            Ok(reply) => {
                let trimmed = reply.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "context prefix generation failed");
                None
            }
        }
    }
}

/// Clip a document to `max_chars`: keep the head two thirds and the tail,
/// with an elision marker in between.
fn truncate_document(document: &str, max_chars: usize) -> String {
    let chars: Vec<char> = document.chars().collect();
    if chars.len() <= max_chars {
        return document.to_string();
    }

    let head_size = max_chars * 2 / 3;
    let tail_size = max_chars.saturating_sub(head_size).saturating_sub(20);
    let head: String = chars[..head_size].iter().collect();
    let tail: String = chars[chars.len() - tail_size..].iter().collect();
    format!("{head}\n\n[... 中间内容已省略 ...]\n\n{tail}")
}
