//! Session history management and summarisation compaction.
//!
//! Every saved message bumps the session's counter under a per-session
//! critical section; once the counter reaches `summary_threshold * 2`, the
//! older history (everything except the last `max_history_rounds * 2`
//! messages) is compressed into the session's rolling summary by the LLM
//! and deleted. A failed compaction is logged and leaves all state
//! untouched — the next save simply tries again.
//!
//! Prompt assembly walks the history newest-first, prepending messages
//! until the caller's token budget would be exceeded, and returns them in
//! chronological order with the summary (if any) as a leading system turn.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::llm::router::LlmRouter;
use crate::llm::{self, ChatRequest};
use crate::models::{ChatMessage, ChatSession, MessageRole};
use crate::repo::{MessageRepo, SessionRepo};
use crate::token::estimate_tokens;

/// Session history manager.
pub struct ContextManager {
    sessions: SessionRepo,
    messages: MessageRepo,
    router: Arc<LlmRouter>,
    config: ContextConfig,
    /// Per-session compaction locks; at most one compaction in flight per
    /// session, and the counter check happens under the same lock.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ContextManager {
    pub fn new(
        sessions: SessionRepo,
        messages: MessageRepo,
        router: Arc<LlmRouter>,
        config: ContextConfig,
    ) -> Self {
        Self {
            sessions,
            messages,
            router,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self, document_ids: Option<&str>) -> Result<ChatSession> {
        self.sessions.create(document_ids).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        self.sessions.get(session_id).await
    }

    /// Persist one turn and run compaction when the history has grown
    /// past twice the summary threshold.
    pub async fn save_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        citations: Option<String>,
    ) -> Result<()> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            token_count: estimate_tokens(content) as i64,
            citations,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.messages.insert(&message).await?;

        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let count = self.sessions.increment_message_count(session_id).await?;
        if count >= (self.config.summary_threshold * 2) as i64 {
            if let Err(e) = self.compact_history(session_id).await {
                tracing::warn!(session_id, error = %e, "history compaction failed");
            }
        }
        Ok(())
    }

    /// Build the budgeted message list for an LLM request.
    pub async fn context_messages(
        &self,
        session_id: &str,
        max_tokens: usize,
    ) -> Result<Vec<llm::ChatMessage>> {
        let mut result = Vec::new();
        let mut total_tokens = 0usize;

        if let Some(session) = self.sessions.get(session_id).await? {
            if let Some(summary) = session.summary.as_deref().filter(|s| !s.is_empty()) {
                let summary_tokens = estimate_tokens(summary);
                if total_tokens + summary_tokens < max_tokens {
                    result.push(llm::ChatMessage::system(format!(
                        "之前的对话摘要：{summary}"
                    )));
                    total_tokens += summary_tokens;
                }
            }
        }

        let history = self.messages.list_ascending(session_id).await?;
        let mut recent: Vec<llm::ChatMessage> = Vec::new();

        for message in history.iter().rev() {
            let message_tokens = if message.token_count > 0 {
                message.token_count as usize
            } else {
                estimate_tokens(&message.content)
            };
            if total_tokens + message_tokens > max_tokens {
                break;
            }
            recent.insert(
                0,
                llm::ChatMessage::new(message.role.wire_role(), message.content.clone()),
            );
            total_tokens += message_tokens;
        }

        result.extend(recent);
        tracing::debug!(
            session_id,
            messages = result.len(),
            tokens = total_tokens,
            "context assembled"
        );
        Ok(result)
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Compress everything but the most recent `max_history_rounds * 2`
    /// messages into the session summary, then delete the compressed rows.
    async fn compact_history(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(());
        };
        let history = self.messages.list_ascending(session_id).await?;
        if history.len() < self.config.summary_threshold {
            return Ok(());
        }

        let keep = self.config.max_history_rounds * 2;
        if history.len() <= keep {
            return Ok(());
        }
        let to_compact = &history[..history.len() - keep];

        let mut prompt = String::from("请将以下对话历史压缩为简短摘要，保留关键信息：\n\n");
        for message in to_compact {
            prompt.push_str(message.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&message.content);
            prompt.push('\n');
        }

        let summary = self
            .router
            .primary()
            .chat(&ChatRequest::single(prompt, 500, 0.3))
            .await
            .map_err(|e| anyhow::anyhow!("summary generation failed: {e}"))?;

        let combined = match session.summary.as_deref().filter(|s| !s.is_empty()) {
            Some(existing) => format!("{existing}\n{}", summary.trim()),
            None => summary.trim().to_string(),
        };
        self.sessions.set_summary(session_id, &combined).await?;

        let ids: Vec<String> = to_compact.iter().map(|m| m.id.clone()).collect();
        self.messages.delete_by_ids(&ids).await?;

        tracing::info!(
            session_id,
            compacted = to_compact.len(),
            "history compacted into summary"
        );
        Ok(())
    }
}
