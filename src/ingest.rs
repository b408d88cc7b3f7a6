//! Document ingestion pipeline.
//!
//! Upload flow: validate → store the file → create the document row →
//! return immediately while a spawned task runs parse → chunk → enrich →
//! persist chunks → embed → vector insert → BM25 index. The task moves the
//! document's status to READY or FAILED exactly once; any failure inside
//! the pipeline marks FAILED, while enrichment failures only cost the
//! affected chunks their locator prefixes.
//!
//! Vector and BM25 state are secondary indices of the chunk table and are
//! never repaired in place — `reindex` drops and rebuilds them from the
//! persisted chunks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::bm25::{Bm25Chunk, Bm25Index};
use crate::chunker::chunk_text;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::enrich::ContextualEnricher;
use crate::error::DocError;
use crate::models::{ChunkMetadata, Document, DocumentChunk, DocumentStatus};
use crate::parse::parser_for;
use crate::repo::{ChunkRepo, DocumentRepo};
use crate::vector::{VectorRecord, VectorStore};

/// Owns the ingestion pipeline and the document lifecycle.
pub struct DocumentService {
    config: Arc<Config>,
    documents: DocumentRepo,
    chunks: ChunkRepo,
    vector: Arc<dyn VectorStore>,
    bm25: Arc<Bm25Index>,
    embedder: Arc<dyn EmbeddingProvider>,
    enricher: Arc<ContextualEnricher>,
}

impl DocumentService {
    pub fn new(
        config: Arc<Config>,
        documents: DocumentRepo,
        chunks: ChunkRepo,
        vector: Arc<dyn VectorStore>,
        bm25: Arc<Bm25Index>,
        embedder: Arc<dyn EmbeddingProvider>,
        enricher: Arc<ContextualEnricher>,
    ) -> Self {
        Self {
            config,
            documents,
            chunks,
            vector,
            bm25,
            embedder,
            enricher,
        }
    }

    /// Accept an upload: validate, store, record, and kick off processing.
    ///
    /// Returns the PROCESSING document immediately; parsing and indexing
    /// continue in a background task.
    pub async fn upload(
        self: Arc<Self>,
        filename: &str,
        bytes: Vec<u8>,
        skip_enrichment: bool,
    ) -> Result<Document> {
        self.validate_upload(filename, &bytes)?;

        let document_id = uuid::Uuid::new_v4().to_string();
        let file_path = self.store_file(&document_id, filename, &bytes).await?;

        let now = chrono::Utc::now().timestamp();
        let mut document = Document {
            id: document_id,
            filename: filename.to_string(),
            file_type: file_extension(filename),
            file_size: bytes.len() as i64,
            file_path: file_path.display().to_string(),
            status: DocumentStatus::Uploading,
            chunk_count: 0,
            full_text: None,
            created_at: now,
            updated_at: now,
        };
        self.documents.create(&document).await?;

        self.documents
            .update_status(&document.id, DocumentStatus::Processing)
            .await?;
        document.status = DocumentStatus::Processing;

        let service = self.clone();
        let spawned = document.clone();
        tokio::spawn(async move {
            service.process_document(spawned, skip_enrichment).await;
        });

        Ok(document)
    }

    /// Run the pipeline for one document and settle its terminal status.
    pub async fn process_document(&self, document: Document, skip_enrichment: bool) {
        match self.run_pipeline(&document, skip_enrichment).await {
            Ok((chunk_count, full_text)) => {
                if let Err(e) = self
                    .documents
                    .mark_ready(&document.id, chunk_count, &full_text)
                    .await
                {
                    tracing::error!(document_id = %document.id, error = %e, "failed to mark document ready");
                    return;
                }
                tracing::info!(
                    document_id = %document.id,
                    filename = %document.filename,
                    chunks = chunk_count,
                    "document processed"
                );
            }
            Err(e) => {
                tracing::error!(document_id = %document.id, error = %e, "document processing failed");
                if let Err(e) = self
                    .documents
                    .update_status(&document.id, DocumentStatus::Failed)
                    .await
                {
                    tracing::error!(document_id = %document.id, error = %e, "failed to mark document failed");
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        document: &Document,
        skip_enrichment: bool,
    ) -> Result<(i64, String)> {
        let bytes = tokio::fs::read(&document.file_path).await?;
        let parser = parser_for(&document.file_type)?;
        let text = parser.parse(&bytes, &document.filename)?;

        let mut chunks = chunk_text(&document.id, &text, &self.config.chunking);

        if !skip_enrichment && self.config.rag.contextual_retrieval_enabled {
            self.enricher.enrich_chunks(&text, &mut chunks).await;
        } else if skip_enrichment {
            tracing::info!(document_id = %document.id, "contextual enrichment skipped by request");
        }

        // vector records are keyed by chunk id
        for chunk in &mut chunks {
            chunk.vector_id = Some(chunk.id.clone());
        }

        self.chunks.insert_many(&chunks).await?;
        self.index_chunks(document, &chunks).await?;

        Ok((chunks.len() as i64, text))
    }

    /// Embed and index a chunk set into both secondary indices.
    async fn index_chunks(&self, document: &Document, chunks: &[DocumentChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let contents: Vec<String> = chunks.iter().map(|c| c.indexed_content()).collect();
        let embeddings = self.embedder.embed_batch(&contents).await?;
        if embeddings.len() != chunks.len() {
            anyhow::bail!(
                "embedding count mismatch: {} chunks, {} vectors",
                chunks.len(),
                embeddings.len()
            );
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord {
                id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                content: chunk.content.clone(),
                embedding,
                metadata: chunk_metadata(&document.filename, chunk),
            })
            .collect();
        self.vector.insert(records).await?;

        let bm25_chunks: Vec<Bm25Chunk> = chunks
            .iter()
            .zip(contents)
            .map(|(chunk, content)| Bm25Chunk {
                id: chunk.id.clone(),
                content,
                metadata: chunk_metadata(&document.filename, chunk),
            })
            .collect();
        self.bm25.index_chunks(&document.id, bm25_chunks);

        Ok(())
    }

    /// Delete a document and cascade to chunks, vectors, and BM25 state.
    pub async fn delete(&self, document_id: &str) -> Result<()> {
        let document = self.documents.get(document_id).await?;

        self.vector.delete_by_document(document_id).await?;
        self.bm25.delete_by_document(document_id);
        self.chunks.delete_by_document(document_id).await?;
        self.documents.delete(document_id).await?;

        if let Some(document) = document {
            if let Err(e) = tokio::fs::remove_file(&document.file_path).await {
                tracing::warn!(document_id, error = %e, "stored file could not be removed");
            }
        }
        tracing::info!(document_id, "document deleted");
        Ok(())
    }

    /// Rebuild both secondary indices from the persisted chunk rows.
    pub async fn reindex(&self, document_id: &str) -> Result<()> {
        let document = self
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| DocError::InvalidArgument(format!("document not found: {document_id}")))?;
        let chunks = self.chunks.list_by_document(document_id).await?;
        if chunks.is_empty() {
            return Err(DocError::Process(format!(
                "document {document_id} has no chunks to reindex"
            ))
            .into());
        }

        self.vector.delete_by_document(document_id).await?;
        self.bm25.delete_by_document(document_id);
        self.index_chunks(&document, &chunks).await?;

        tracing::info!(document_id, chunks = chunks.len(), "document reindexed");
        Ok(())
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Document> {
        self.documents
            .get(document_id)
            .await?
            .ok_or_else(|| DocError::InvalidArgument(format!("document not found: {document_id}")).into())
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.documents.list().await
    }

    pub async fn document_chunks(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
        self.chunks.list_by_document(document_id).await
    }

    fn validate_upload(&self, filename: &str, bytes: &[u8]) -> Result<(), DocError> {
        if filename.trim().is_empty() || bytes.is_empty() {
            return Err(DocError::Process("uploaded file is empty".into()));
        }

        let file_type = file_extension(filename);
        let allowed = self.config.document.allowed_type_list();
        if !allowed.contains(&file_type) {
            return Err(DocError::Process(format!(
                "unsupported file type: '{file_type}'. allowed: {}",
                allowed.join(",")
            )));
        }

        let limit = self.config.document.max_file_size;
        if bytes.len() as u64 > limit {
            return Err(DocError::FileTooLarge {
                size: bytes.len() as u64,
                limit,
            });
        }
        Ok(())
    }

    async fn store_file(
        &self,
        document_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let dir = &self.config.document.storage_path;
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!("{document_id}_{filename}"));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

fn chunk_metadata(filename: &str, chunk: &DocumentChunk) -> ChunkMetadata {
    ChunkMetadata {
        filename: filename.to_string(),
        chunk_index: chunk.chunk_index,
        heading: chunk.heading.clone().unwrap_or_default(),
        hierarchy: chunk.hierarchy.clone().unwrap_or_default(),
        start_page: chunk.start_page.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_extraction() {
        assert_eq!(file_extension("manual.PDF"), "pdf");
        assert_eq!(file_extension("notes.tar.md"), "md");
        assert_eq!(file_extension("no-extension"), "");
    }
}
