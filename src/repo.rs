//! Row-mapped repositories for the four persisted tables.
//!
//! Thin wrappers over `sqlx` queries; each repo clones cheaply around the
//! shared pool. Writes are single statements (atomic per row), and ingest
//! status transitions go through [`DocumentRepo::update_status`] exactly
//! once per outcome.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{ChatMessage, ChatSession, Document, DocumentChunk, DocumentStatus, MessageRole};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ documents ============

#[derive(Clone)]
pub struct DocumentRepo {
    pool: SqlitePool,
}

impl DocumentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, filename, file_type, file_size, file_path, status, chunk_count, full_text, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.file_type)
        .bind(doc.file_size)
        .bind(&doc.file_path)
        .bind(doc.status.as_str())
        .bind(doc.chunk_count)
        .bind(&doc.full_text)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| map_document(&r)))
    }

    pub async fn list(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at DESC, rowid DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_document).collect())
    }

    pub async fn update_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal success transition: READY plus chunk count and full text.
    pub async fn mark_ready(&self, id: &str, chunk_count: i64, full_text: &str) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?, chunk_count = ?, full_text = ?, updated_at = ? WHERE id = ?",
        )
        .bind(DocumentStatus::Ready.as_str())
        .bind(chunk_count)
        .bind(full_text)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        filename: row.get("filename"),
        file_type: row.get("file_type"),
        file_size: row.get("file_size"),
        file_path: row.get("file_path"),
        status: DocumentStatus::parse(row.get::<String, _>("status").as_str()),
        chunk_count: row.get("chunk_count"),
        full_text: row.get("full_text"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

// ============ document_chunks ============

#[derive(Clone)]
pub struct ChunkRepo {
    pool: SqlitePool,
}

impl ChunkRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_many(&self, chunks: &[DocumentChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunks
                    (id, document_id, chunk_index, content, heading, hierarchy, start_page, end_page, token_count, context_prefix, vector_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.heading)
            .bind(&chunk.hierarchy)
            .bind(chunk.start_page)
            .bind(chunk.end_page)
            .bind(chunk.token_count)
            .bind(&chunk.context_prefix)
            .bind(&chunk.vector_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_by_document(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            "SELECT * FROM document_chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_chunk).collect())
    }

    pub async fn count(&self, document_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Distinct non-empty hierarchy paths in chunk order.
    pub async fn distinct_hierarchies(&self, document_id: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT hierarchy FROM document_chunks
            WHERE document_id = ? AND hierarchy IS NOT NULL AND hierarchy != ''
            ORDER BY hierarchy
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn map_chunk(row: &sqlx::sqlite::SqliteRow) -> DocumentChunk {
    DocumentChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        heading: row.get("heading"),
        hierarchy: row.get("hierarchy"),
        start_page: row.get("start_page"),
        end_page: row.get("end_page"),
        token_count: row.get("token_count"),
        context_prefix: row.get("context_prefix"),
        vector_id: row.get("vector_id"),
    }
}

// ============ chat_sessions ============

#[derive(Clone)]
pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, document_ids: Option<&str>) -> Result<ChatSession> {
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            document_ids: document_ids
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            summary: None,
            message_count: 0,
            created_at: now(),
            updated_at: now(),
        };
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, document_ids, summary, message_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.document_ids)
        .bind(&session.summary)
        .bind(session.message_count)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatSession {
            id: r.get("id"),
            document_ids: r.get("document_ids"),
            summary: r.get("summary"),
            message_count: r.get("message_count"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Bump the message counter and return the new value; 0 when the
    /// session does not exist (messages may outlive their session row).
    pub async fn increment_message_count(&self, id: &str) -> Result<i64> {
        sqlx::query(
            "UPDATE chat_sessions SET message_count = message_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let count: Option<i64> =
            sqlx::query_scalar("SELECT message_count FROM chat_sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }

    /// Store the rolling summary produced by history compaction. The
    /// message counter is left alone: it tracks messages ever saved, so the
    /// compaction trigger keeps firing as new turns arrive.
    pub async fn set_summary(&self, id: &str, summary: &str) -> Result<()> {
        sqlx::query("UPDATE chat_sessions SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============ chat_messages ============

#[derive(Clone)]
pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, session_id, role, content, token_count, citations, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.token_count)
        .bind(&message.citations)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All messages for a session, oldest first. Insertion order breaks
    /// same-second timestamp ties.
    pub async fn list_ascending(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE session_id = ? ORDER BY created_at, rowid",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ChatMessage {
                id: r.get("id"),
                session_id: r.get("session_id"),
                role: MessageRole::parse(r.get::<String, _>("role").as_str()),
                content: r.get("content"),
                token_count: r.get("token_count"),
                citations: r.get("citations"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM chat_messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
