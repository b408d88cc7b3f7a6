//! Core data models used throughout the service.
//!
//! These types represent the documents, chunks, sessions, and messages that
//! flow through the ingestion and answer pipelines. The data lifecycle is:
//!
//! ```text
//! upload → Document(PROCESSING) → parse → chunk() → DocumentChunk
//!                                              ↓
//!                        embed() → vector store + BM25 index
//!                                              ↓
//!               retrieve() → SearchHit → Citation → ChatChunk (SSE)
//! ```
//!
//! Entities mirror the four persisted tables; DTO structs serialize with
//! camelCase field names for the HTTP API.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an uploaded document.
///
/// `Ready` is terminal for success, `Failed` for failure; the transition out
/// of `Processing` happens exactly once per ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "UPLOADING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "UPLOADING" => DocumentStatus::Uploading,
            "PROCESSING" => DocumentStatus::Processing,
            "READY" => DocumentStatus::Ready,
            _ => DocumentStatus::Failed,
        }
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
            MessageRole::System => "SYSTEM",
        }
    }

    /// Lowercase wire role for LLM requests.
    pub fn wire_role(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "USER" => MessageRole::User,
            "SYSTEM" => MessageRole::System,
            _ => MessageRole::Assistant,
        }
    }
}

/// A stored document, uniquely owning its chunks and index entries.
#[derive(Debug, Clone)]
pub struct Document {
    /// UUID v4 primary key.
    pub id: String,
    pub filename: String,
    /// Lowercased extension: `pdf`, `md`, `markdown`, or `txt`.
    pub file_type: String,
    pub file_size: i64,
    /// Path of the stored upload on disk.
    pub file_path: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    /// Canonical post-parse text; set when processing succeeds.
    pub full_text: Option<String>,
    /// Unix epoch seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// A bounded text fragment with heading metadata, the unit of retrieval.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    /// UUID v4 primary key; doubles as the vector record id.
    pub id: String,
    pub document_id: String,
    /// Zero-based, dense per document.
    pub chunk_index: i64,
    pub content: String,
    /// The chunk's own section title.
    pub heading: Option<String>,
    /// ` > `-joined ancestor headings, e.g. `"1. Basics > 1.2 Volume"`.
    pub hierarchy: Option<String>,
    pub start_page: Option<i64>,
    pub end_page: Option<i64>,
    pub token_count: i64,
    /// LLM-generated locator sentence prepended for indexing only.
    pub context_prefix: Option<String>,
    /// Id of the chunk's vector record; equals the chunk id once indexed.
    pub vector_id: Option<String>,
}

impl DocumentChunk {
    /// Content used for embedding and BM25 indexing: locator prefix plus
    /// body when a prefix exists, plain body otherwise. Display and
    /// citations always use the raw content.
    pub fn indexed_content(&self) -> String {
        match &self.context_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}\n{}", prefix, self.content),
            _ => self.content.clone(),
        }
    }
}

/// A chat session and the documents it is scoped to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    /// Comma-joined document ids; empty/None for open chat.
    pub document_ids: Option<String>,
    /// Rolling summary of compacted history.
    pub summary: Option<String>,
    pub message_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One persisted conversation turn.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub token_count: i64,
    /// Serialized citation list for assistant turns.
    pub citations: Option<String>,
    pub created_at: i64,
}

// ============ Retrieval types ============

/// Metadata carried alongside every indexed chunk.
///
/// Stored in the vector record and the BM25 entry so either search branch
/// can build citations without a repository round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub filename: String,
    pub chunk_index: i64,
    pub heading: String,
    pub hierarchy: String,
    pub start_page: i64,
}

/// A scored chunk returned by dense, BM25, or fused search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Chunk id.
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub score: f64,
    pub metadata: ChunkMetadata,
}

// ============ HTTP DTOs ============

/// Document representation returned by the HTTP API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDto {
    pub id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    pub created_at: i64,
}

impl DocumentDto {
    pub fn from_document(doc: &Document, include_full_text: bool) -> Self {
        Self {
            id: doc.id.clone(),
            filename: doc.filename.clone(),
            file_type: doc.file_type.clone(),
            file_size: doc.file_size,
            status: doc.status,
            chunk_count: doc.chunk_count,
            full_text: if include_full_text {
                doc.full_text.clone()
            } else {
                None
            },
            created_at: doc.created_at,
        }
    }
}

/// Chunk representation returned by the HTTP API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDto {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hierarchy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_page: Option<i64>,
    pub token_count: i64,
}

impl From<&DocumentChunk> for ChunkDto {
    fn from(c: &DocumentChunk) -> Self {
        Self {
            id: c.id.clone(),
            document_id: c.document_id.clone(),
            chunk_index: c.chunk_index,
            content: c.content.clone(),
            heading: c.heading.clone(),
            hierarchy: c.hierarchy.clone(),
            start_page: c.start_page,
            end_page: c.end_page,
            token_count: c.token_count,
        }
    }
}

/// A source reference attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    pub excerpt: String,
    pub score: f64,
}

/// One frame of a streamed answer.
///
/// Intermediate frames carry non-empty `content`; the single terminal frame
/// has `complete = true`, empty content, and the citation list (or an error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunk {
    pub content: String,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl ChatChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            complete: false,
            citations: None,
            error: None,
            warning: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            complete: false,
            citations: None,
            error: None,
            warning: Some(message.into()),
        }
    }

    pub fn terminal(citations: Vec<Citation>) -> Self {
        Self {
            content: String::new(),
            complete: true,
            citations: Some(citations),
            error: None,
            warning: None,
        }
    }

    pub fn terminal_error(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            complete: true,
            citations: None,
            error: Some(message.into()),
            warning: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            DocumentStatus::Uploading,
            DocumentStatus::Processing,
            DocumentStatus::Ready,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn indexed_content_uses_prefix_when_present() {
        let mut chunk = DocumentChunk {
            id: "c1".into(),
            document_id: "d1".into(),
            chunk_index: 0,
            content: "body".into(),
            heading: None,
            hierarchy: None,
            start_page: None,
            end_page: None,
            token_count: 1,
            context_prefix: None,
            vector_id: None,
        };
        assert_eq!(chunk.indexed_content(), "body");
        chunk.context_prefix = Some("locator".into());
        assert_eq!(chunk.indexed_content(), "locator\nbody");
    }

    #[test]
    fn chat_chunk_serializes_camel_case() {
        let chunk = ChatChunk::terminal(vec![Citation {
            chunk_id: "c1".into(),
            document_id: "d1".into(),
            document_name: "manual.pdf".into(),
            page_number: Some(3),
            excerpt: "…".into(),
            score: 0.42,
        }]);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["complete"], true);
        assert_eq!(json["citations"][0]["chunkId"], "c1");
        assert_eq!(json["citations"][0]["pageNumber"], 3);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn terminal_frames_have_empty_content() {
        assert!(ChatChunk::terminal(vec![]).content.is_empty());
        assert!(ChatChunk::terminal_error("boom").content.is_empty());
    }
}
