//! Vector store abstraction and the in-memory cosine backend.
//!
//! The store is a secondary index over document chunks: record ids equal
//! chunk ids, and a whole document's records are dropped and re-inserted
//! together. Search supports two filter keys:
//!
//! - `document_ids` — exact match for one id, membership for several;
//! - `hierarchy` — prefix match against the record's hierarchy path.
//!
//! The default backend scans linearly and scores by cosine similarity,
//! which is comfortably fast for the tens of thousands of chunks a single
//! deployment holds. A clustered ANN service can implement the same trait
//! with the same filter keys and ordering.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::VectorConfig;
use crate::models::{ChunkMetadata, SearchHit};

/// A stored embedding with its source chunk content and metadata.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Chunk id.
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Search-time filter; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict to these document ids (empty = no restriction).
    pub document_ids: Vec<String>,
    /// Restrict to records whose hierarchy starts with this path.
    pub hierarchy: Option<String>,
}

impl SearchFilter {
    pub fn for_documents(ids: &[String]) -> Self {
        Self {
            document_ids: ids.to_vec(),
            hierarchy: None,
        }
    }

    pub fn with_hierarchy(mut self, hierarchy: Option<String>) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    fn matches(&self, record: &VectorRecord) -> bool {
        if !self.document_ids.is_empty() && !self.document_ids.contains(&record.document_id) {
            return false;
        }
        if let Some(prefix) = &self.hierarchy {
            return record.metadata.hierarchy.starts_with(prefix.as_str());
        }
        true
    }
}

/// Trait for vector store backends.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert records, replacing any with the same id.
    async fn insert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Top-k cosine search, descending score, insertion order on ties.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>>;

    /// Remove every record belonging to a document; returns removed count.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    /// Number of records stored for a document.
    async fn count_for_document(&self, document_id: &str) -> Result<usize>;
}

/// Instantiate the configured backend.
pub fn create_vector_store(config: &VectorConfig) -> Result<std::sync::Arc<dyn VectorStore>> {
    match config.kind.as_str() {
        "memory" => Ok(std::sync::Arc::new(InMemoryVectorStore::new())),
        "milvus" => anyhow::bail!(
            "vector backend 'milvus' is not bundled with this build; configure vector.type = \"memory\""
        ),
        other => anyhow::bail!("Unknown vector backend: {}", other),
    }
}

/// Brute-force cosine store over an insertion-ordered record list.
pub struct InMemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cosine similarity; 0.0 for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut stored = self.records.write().expect("vector store lock poisoned");
        for record in records {
            match stored.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => stored.push(record),
            }
        }
        tracing::debug!(total = stored.len(), "vector records inserted");
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        let stored = self.records.read().expect("vector store lock poisoned");

        let mut hits: Vec<SearchHit> = stored
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| SearchHit {
                id: r.id.clone(),
                document_id: r.document_id.clone(),
                content: r.content.clone(),
                score: cosine_similarity(query, &r.embedding),
                metadata: r.metadata.clone(),
            })
            .collect();

        // stable sort keeps insertion order between equal scores
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut stored = self.records.write().expect("vector store lock poisoned");
        let before = stored.len();
        stored.retain(|r| r.document_id != document_id);
        let removed = before - stored.len();
        tracing::debug!(document_id, removed, "vector records deleted");
        Ok(removed)
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        let stored = self.records.read().expect("vector store lock poisoned");
        Ok(stored.iter().filter(|r| r.document_id == document_id).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, doc: &str, hierarchy: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            document_id: doc.to_string(),
            content: format!("content of {id}"),
            embedding,
            metadata: ChunkMetadata {
                filename: "test.md".into(),
                chunk_index: 0,
                heading: String::new(),
                hierarchy: hierarchy.to_string(),
                start_page: 0,
            },
        }
    }

    #[tokio::test]
    async fn search_orders_by_descending_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                record("far", "d1", "", vec![0.0, 1.0]),
                record("near", "d1", "", vec![1.0, 0.1]),
                record("exact", "d1", "", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near", "far"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn document_filter_is_membership() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                record("a", "d1", "", vec![1.0, 0.0]),
                record("b", "d2", "", vec![1.0, 0.0]),
                record("c", "d3", "", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let filter = SearchFilter::for_documents(&["d1".to_string(), "d3".to_string()]);
        let hits = store.search(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.document_id != "d2"));
    }

    #[tokio::test]
    async fn hierarchy_filter_is_prefix_match() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                record("a", "d1", "Guide > Install", vec![1.0, 0.0]),
                record("b", "d1", "Guide > Usage", vec![1.0, 0.0]),
                record("c", "d1", "Reference", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let filter =
            SearchFilter::for_documents(&["d1".to_string()]).with_hierarchy(Some("Guide".into()));
        let hits = store.search(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits
            .iter()
            .all(|h| h.metadata.hierarchy.starts_with("Guide")));
    }

    #[tokio::test]
    async fn insert_replaces_same_id() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![record("a", "d1", "", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .insert(vec![record("a", "d1", "", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.count_for_document("d1").await.unwrap(), 1);
        let hits = store
            .search(&[0.0, 1.0], 1, &SearchFilter::default())
            .await
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn delete_removes_whole_document() {
        let store = InMemoryVectorStore::new();
        store
            .insert(vec![
                record("a", "d1", "", vec![1.0, 0.0]),
                record("b", "d1", "", vec![0.0, 1.0]),
                record("c", "d2", "", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let removed = store.delete_by_document("d1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_for_document("d1").await.unwrap(), 0);
        assert_eq!(store.count_for_document("d2").await.unwrap(), 1);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn milvus_backend_is_rejected() {
        let config = VectorConfig {
            kind: "milvus".into(),
            ..Default::default()
        };
        assert!(create_vector_store(&config).is_err());
    }
}
