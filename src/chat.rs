//! Chat orchestration: retrieval, prompt assembly, streaming, fallback.
//!
//! `stream_answer` drives the full question-answering flow and hands the
//! caller a stream of [`ChatChunk`] frames:
//!
//! 1. persist the USER turn;
//! 2. resolve document scope (request value wins over the session's);
//! 3. retrieve grounded context and citations;
//! 4. pick the system prompt (summary intent / grounded / no-content /
//!    open chat);
//! 5. stream the model, forwarding deltas as intermediate frames;
//! 6. on stream failure, emit a warning frame naming both models and
//!    restart against the fallback client;
//! 7. on completion, persist the ASSISTANT turn and emit one terminal
//!    frame with the citations.
//!
//! If the consumer drops the stream mid-answer, the provider connection is
//! dropped and no partial assistant message is persisted.

use std::sync::Arc;
use std::sync::LazyLock;

use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::context::ContextManager;
use crate::error::LlmError;
use crate::llm::router::LlmRouter;
use crate::llm::{self, ChatRequest, LlmClient};
use crate::models::{ChatChunk, ChatSession, Citation, MessageRole};
use crate::rag::{RagEngine, RetrievalResult};

/// Queries that ask for a document overview get the summary prompt.
static SUMMARY_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(总结|概括|主要内容|讲了什么|介绍一下|大纲|summary|overview)")
        .expect("summary intent pattern")
});

const GROUNDED_PROMPT_TEMPLATE: &str = "你是一个专业的文档问答助手。请根据以下提供的文档内容回答用户的问题。\n\n\
要求：\n\
1. 只根据提供的文档内容回答，不要编造信息\n\
2. 如果文档中没有相关信息，请明确说明\n\
3. 回答要准确、全面、有条理，不要遗漏重要细节\n\
4. 在回答中适当引用文档内容\n\n\
文档内容：\n";

const SUMMARY_PROMPT_TEMPLATE: &str = "你是一个专业的文档分析专家。请根据以下文档内容，为用户提供一份全景式的深度总结。\n\n\
目标：\n\
对文档进行全面、详尽的解读，提取所有核心价值点，确保读者无需阅读原文即可掌握所有重要细节。\n\n\
要求：\n\
1. **结构清晰**：使用多级标题（一、1、(1)...）构建层级分明的结构。\n\
2. **细节丰富**：不要只写概括性的话，必须提取具体的功能名称、参数、步骤或关键术语。\n\
3. **全面覆盖**：涵盖文档的每一个主要章节，不要遗漏任何重要部分。\n\
4. **专业术语**：保留原文中的专业术语。\n\n\
文档内容：\n";

const NO_CONTENT_PROMPT: &str = "You are a helpful assistant. The user asked a question about a document, \
but the retrieval system found NO relevant content (similarity too low or vector store empty).\n\
Please politely inform the user that you couldn't find specific information in the uploaded document \
regarding their query.\n\
Then, ONLY if you have general knowledge about the topic, you may answer but MUST start with \
'Based on general knowledge (not the document)...'.";

const OPEN_CHAT_PROMPT: &str = "你是一个智能助手。请直接回答用户的问题，无需参考任何文档。";

/// One question aimed at a session.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub query: String,
    pub session_id: String,
    /// Single id or comma-separated list; overrides the session scope.
    pub document_id: Option<String>,
    /// Client type requested by the caller (`"azure"`, `"dashscope"`, ...).
    pub model_type: Option<String>,
}

enum PumpOutcome {
    Completed,
    Cancelled,
    Failed(LlmError),
}

/// End-to-end question answering over a session.
pub struct ChatOrchestrator {
    rag: Arc<RagEngine>,
    context: Arc<ContextManager>,
    router: Arc<LlmRouter>,
    config: Arc<Config>,
}

impl ChatOrchestrator {
    pub fn new(
        rag: Arc<RagEngine>,
        context: Arc<ContextManager>,
        router: Arc<LlmRouter>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            rag,
            context,
            router,
            config,
        }
    }

    pub async fn create_session(&self, document_id: Option<&str>) -> anyhow::Result<ChatSession> {
        self.context.create_session(document_id).await
    }

    /// Streamed answer; the returned stream always ends with exactly one
    /// `complete: true` frame.
    pub fn stream_answer(self: Arc<Self>, request: AskRequest) -> BoxStream<'static, ChatChunk> {
        let (tx, rx) = mpsc::channel::<ChatChunk>(32);
        let orchestrator = self;
        tokio::spawn(async move {
            orchestrator.drive(request, tx).await;
        });
        ReceiverStream::new(rx).boxed()
    }

    /// Synchronous answer: one terminal chunk with the whole reply.
    pub async fn answer(&self, request: AskRequest) -> ChatChunk {
        if let Err(e) = self
            .context
            .save_message(&request.session_id, MessageRole::User, &request.query, None)
            .await
        {
            return ChatChunk::terminal_error(format!("回答生成失败: {e}"));
        }

        let (retrieval, chat_request) = match self.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(e) => return ChatChunk::terminal_error(format!("回答生成失败: {e}")),
        };

        let client = self.router.get_client(request.model_type.as_deref());
        match client.chat(&chat_request).await {
            Ok(reply) => {
                self.persist_assistant(&request.session_id, &reply, &retrieval.citations)
                    .await;
                ChatChunk {
                    content: reply,
                    complete: true,
                    citations: Some(retrieval.citations),
                    error: None,
                    warning: None,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "chat failed, trying fallback");
                let fallback = self.router.fallback_for(&client);
                if Arc::ptr_eq(&fallback, &client) {
                    return ChatChunk::terminal_error(format!("回答生成失败: {e}"));
                }
                match fallback.chat(&chat_request).await {
                    Ok(reply) => {
                        self.persist_assistant(&request.session_id, &reply, &retrieval.citations)
                            .await;
                        ChatChunk {
                            content: format!("{reply}\n\n[注: 使用了备用模型回答]"),
                            complete: true,
                            citations: Some(retrieval.citations),
                            error: None,
                            warning: None,
                        }
                    }
                    Err(e2) => ChatChunk::terminal_error(format!("回答生成失败: {e2}")),
                }
            }
        }
    }

    async fn drive(&self, request: AskRequest, tx: mpsc::Sender<ChatChunk>) {
        if let Err(e) = self
            .context
            .save_message(&request.session_id, MessageRole::User, &request.query, None)
            .await
        {
            let _ = tx
                .send(ChatChunk::terminal_error(format!("回答生成失败: {e}")))
                .await;
            return;
        }

        let (retrieval, chat_request) = match self.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(error = %e, "answer preparation failed");
                let _ = tx
                    .send(ChatChunk::terminal_error(format!("回答生成失败: {e}")))
                    .await;
                return;
            }
        };

        let client = self.router.get_client(request.model_type.as_deref());
        let mut full_response = String::new();

        match self
            .pump(&client, &chat_request, &tx, &mut full_response)
            .await
        {
            PumpOutcome::Completed => {
                self.finish(&request.session_id, &full_response, retrieval.citations, &tx)
                    .await;
            }
            PumpOutcome::Cancelled => {}
            PumpOutcome::Failed(e) => {
                tracing::error!(error = %e, "primary model stream failed, attempting fallback");

                let fallback = self.router.fallback_for(&client);
                if Arc::ptr_eq(&fallback, &client) {
                    let _ = tx
                        .send(ChatChunk::terminal_error(format!("回答生成失败: {e}")))
                        .await;
                    return;
                }

                let warning = format!(
                    "模型 {} 响应超时，已自动切换至 {} 继续回答...",
                    client.model_name(),
                    fallback.model_name()
                );
                if tx.send(ChatChunk::warning(warning)).await.is_err() {
                    return;
                }

                match self
                    .pump(&fallback, &chat_request, &tx, &mut full_response)
                    .await
                {
                    PumpOutcome::Completed => {
                        self.finish(&request.session_id, &full_response, retrieval.citations, &tx)
                            .await;
                    }
                    PumpOutcome::Cancelled => {}
                    PumpOutcome::Failed(e2) => {
                        let _ = tx
                            .send(ChatChunk::terminal_error(format!("回答生成失败: {e2}")))
                            .await;
                    }
                }
            }
        }
    }

    /// Forward one client's stream into the chunk channel.
    async fn pump(
        &self,
        client: &Arc<dyn LlmClient>,
        request: &ChatRequest,
        tx: &mpsc::Sender<ChatChunk>,
        full_response: &mut String,
    ) -> PumpOutcome {
        let mut stream = match client.stream_chat(request).await {
            Ok(stream) => stream,
            Err(e) => return PumpOutcome::Failed(e),
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => {
                    full_response.push_str(&delta);
                    if tx.send(ChatChunk::delta(delta)).await.is_err() {
                        return PumpOutcome::Cancelled;
                    }
                }
                Err(e) => return PumpOutcome::Failed(e),
            }
        }
        PumpOutcome::Completed
    }

    /// Persist the assistant turn, then emit the terminal frame.
    async fn finish(
        &self,
        session_id: &str,
        full_response: &str,
        citations: Vec<Citation>,
        tx: &mpsc::Sender<ChatChunk>,
    ) {
        self.persist_assistant(session_id, full_response, &citations)
            .await;
        let _ = tx.send(ChatChunk::terminal(citations)).await;
    }

    async fn persist_assistant(&self, session_id: &str, content: &str, citations: &[Citation]) {
        let serialized = serde_json::to_string(citations).ok();
        if let Err(e) = self
            .context
            .save_message(session_id, MessageRole::Assistant, content, serialized)
            .await
        {
            tracing::error!(session_id, error = %e, "failed to persist assistant message");
        }
    }

    /// Run retrieval and assemble the LLM request.
    async fn prepare(
        &self,
        request: &AskRequest,
    ) -> anyhow::Result<(RetrievalResult, ChatRequest)> {
        let document_ids = self
            .resolve_document_ids(&request.session_id, request.document_id.as_deref())
            .await?;

        let retrieval = if document_ids.is_empty() {
            RetrievalResult::default()
        } else {
            self.rag.retrieve(&request.query, &document_ids).await?
        };

        let system_prompt =
            select_system_prompt(&request.query, &retrieval.context, !document_ids.is_empty());

        let budget = self.config.context.max_context_tokens / 2;
        let mut messages = self
            .context
            .context_messages(&request.session_id, budget)
            .await?;
        messages.push(llm::ChatMessage::user(request.query.clone()));

        let chat_request = ChatRequest {
            system_prompt: Some(system_prompt),
            messages,
            max_tokens: Some(self.config.llm.primary.max_tokens),
            temperature: Some(0.7),
            model_override: request.model_type.clone(),
        };
        Ok((retrieval, chat_request))
    }

    /// Document scope: the request's ids when present and not the literal
    /// `"null"`, otherwise the session's stored CSV.
    async fn resolve_document_ids(
        &self,
        session_id: &str,
        document_id: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        if let Some(raw) = document_id
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        {
            return Ok(split_csv(raw));
        }

        if let Some(session) = self.context.session(session_id).await? {
            if let Some(ids) = session.document_ids.as_deref() {
                return Ok(split_csv(ids));
            }
        }
        Ok(Vec::new())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Pick the system prompt for this turn.
fn select_system_prompt(query: &str, context: &str, has_documents: bool) -> String {
    if !context.is_empty() {
        if SUMMARY_INTENT.is_match(query) {
            tracing::info!("summary intent detected, using summary prompt");
            format!("{SUMMARY_PROMPT_TEMPLATE}{context}")
        } else {
            format!("{GROUNDED_PROMPT_TEMPLATE}{context}")
        }
    } else if has_documents {
        NO_CONTENT_PROMPT.to_string()
    } else {
        OPEN_CHAT_PROMPT.to_string()
    }
}
