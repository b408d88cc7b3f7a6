//! Hybrid retrieval engine.
//!
//! For a query scoped to one or more documents, retrieval runs as:
//!
//! 1. **Small-document shortcut** — a single document at or below the chunk
//!    threshold is answered from its full text, skipping search entirely.
//! 2. **Query expansion** — short single-document queries are rephrased by
//!    the LLM; the expansion is *concatenated* onto the original for
//!    embedding (never replacing it), so exact-keyword recall survives.
//! 3. **Routed dense search** — the router predicts a hierarchy path to
//!    pre-filter vector search; thin or low-scoring results fall back to a
//!    document-wide search.
//! 4. **BM25** — keyword search always runs with the original query.
//! 5. **RRF fusion** — both ranked lists merge by reciprocal rank; fused
//!    order is the final order, with no score threshold afterwards (RRF
//!    scores live in the 0.01–0.03 range and only their order matters).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::bm25::Bm25Index;
use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::llm::router::LlmRouter;
use crate::llm::ChatRequest;
use crate::models::{Citation, SearchHit};
use crate::repo::{ChunkRepo, DocumentRepo};
use crate::vector::{SearchFilter, VectorStore};

/// Reciprocal-rank-fusion constant.
const RRF_K: f64 = 60.0;
/// Queries at or below this many characters get expanded.
const EXPANSION_MAX_QUERY_CHARS: usize = 50;
/// Synthetic chunk id for the small-document shortcut citation.
const FULL_DOCUMENT_CHUNK_ID: &str = "full-document";
/// Citations attached to an answer at most.
const MAX_CITATIONS: usize = 5;

/// Context text plus citations, ready for prompt assembly.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub context: String,
    pub citations: Vec<Citation>,
}

/// The retrieval engine; cheap to share behind an `Arc`.
pub struct RagEngine {
    vector: Arc<dyn VectorStore>,
    bm25: Arc<Bm25Index>,
    embedder: Arc<dyn EmbeddingProvider>,
    router: Arc<LlmRouter>,
    documents: DocumentRepo,
    chunks: ChunkRepo,
    config: RagConfig,
}

impl RagEngine {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        bm25: Arc<Bm25Index>,
        embedder: Arc<dyn EmbeddingProvider>,
        router: Arc<LlmRouter>,
        documents: DocumentRepo,
        chunks: ChunkRepo,
        config: RagConfig,
    ) -> Self {
        Self {
            vector,
            bm25,
            embedder,
            router,
            documents,
            chunks,
            config,
        }
    }

    /// Retrieve grounded context for a query over the given documents.
    pub async fn retrieve(&self, query: &str, document_ids: &[String]) -> Result<RetrievalResult> {
        if document_ids.is_empty() {
            return Ok(RetrievalResult::default());
        }
        let single_doc = document_ids.len() == 1;

        if single_doc {
            if let Some(shortcut) = self.small_document_shortcut(&document_ids[0]).await? {
                return Ok(shortcut);
            }
        }

        // expansion feeds only the embedding; BM25 keeps the original query
        let mut embedding_query = query.to_string();
        if single_doc && query.chars().count() <= EXPANSION_MAX_QUERY_CHARS {
            if let Some(expansion) = self.expand_query(query).await {
                embedding_query = format!("{query} {expansion}");
            }
        }

        let embedding = self.embedder.embed(&embedding_query).await?;

        let predicted = if single_doc {
            let hierarchies = self.chunks.distinct_hierarchies(&document_ids[0]).await?;
            self.router.predict_hierarchy(query, &hierarchies).await
        } else {
            None
        };
        if let Some(hierarchy) = &predicted {
            tracing::info!(hierarchy = %hierarchy, "router predicted hierarchy");
        }

        let filter =
            SearchFilter::for_documents(document_ids).with_hierarchy(predicted.clone());
        let mut dense = self
            .vector
            .search(&embedding, self.config.top_k, &filter)
            .await?;

        if predicted.is_some() && self.hierarchy_results_too_thin(&dense) {
            tracing::info!("hierarchy-filtered search too thin, retrying document-wide");
            let unfiltered = SearchFilter::for_documents(document_ids);
            dense = self
                .vector
                .search(&embedding, self.config.top_k, &unfiltered)
                .await?;
        }

        let keyword = self
            .bm25
            .search_multi(query, document_ids, self.config.top_k);

        let fused = rrf_fuse(&dense, &keyword, self.config.top_k);
        tracing::info!(
            dense = dense.len(),
            keyword = keyword.len(),
            fused = fused.len(),
            "retrieval complete"
        );

        Ok(build_result(&fused, document_ids.len() > 1))
    }

    /// Fallback trigger for hierarchy-filtered dense search: empty results,
    /// fewer than max(2, topK/2) hits, or a weak top score.
    fn hierarchy_results_too_thin(&self, hits: &[SearchHit]) -> bool {
        if hits.is_empty() {
            return true;
        }
        if hits.len() < 2usize.max(self.config.top_k / 2) {
            return true;
        }
        hits[0].score < self.config.similarity_threshold * 1.2
    }

    /// Return the full text as the sole context when the document is small
    /// enough that retrieval would only lose information.
    async fn small_document_shortcut(&self, document_id: &str) -> Result<Option<RetrievalResult>> {
        let Some(doc) = self.documents.get(document_id).await? else {
            return Ok(None);
        };
        if doc.chunk_count > self.config.small_document_threshold as i64 {
            return Ok(None);
        }
        let Some(full_text) = doc.full_text.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };

        tracing::info!(
            document_id,
            chunk_count = doc.chunk_count,
            "small document, using full text"
        );
        Ok(Some(RetrievalResult {
            context: full_text.to_string(),
            citations: vec![Citation {
                chunk_id: FULL_DOCUMENT_CHUNK_ID.to_string(),
                document_id: doc.id.clone(),
                document_name: doc.filename.clone(),
                page_number: None,
                excerpt: truncate_chars(full_text, 200),
                score: 1.0,
            }],
        }))
    }

    /// Ask the LLM to rephrase a short query; `None` on any failure.
    async fn expand_query(&self, query: &str) -> Option<String> {
        let prompt = format!(
            "请将下面的查询改写为一个更完整的检索查询，补充同义词和相关表述，使其更容易命中文档内容。\
             只输出改写后的查询，不要输出其他内容。\n\n查询：{query}"
        );
        let request = ChatRequest::single(prompt, 100, 0.3);

        match self.router.primary().chat(&request).await {
            Ok(expansion) => {
                let trimmed = expansion.trim().to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    tracing::debug!(query, expansion = %trimmed, "query expanded");
                    Some(trimmed)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "query expansion failed");
                None
            }
        }
    }
}

/// Merge two ranked lists by Reciprocal Rank Fusion.
///
/// Each hit at 1-based rank `i` contributes `1 / (60 + i)` to its chunk's
/// fused score; chunks in both lists sum their contributions. Dense
/// metadata wins when a chunk appears in both lists. Equal scores break by
/// chunk id so fusion is order-independent in its inputs.
pub fn rrf_fuse(dense: &[SearchHit], keyword: &[SearchHit], top_k: usize) -> Vec<SearchHit> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    let mut hits: HashMap<&str, &SearchHit> = HashMap::new();

    for (rank, hit) in dense.iter().enumerate() {
        *scores.entry(hit.id.as_str()).or_insert(0.0) += 1.0 / (RRF_K + (rank + 1) as f64);
        hits.entry(hit.id.as_str()).or_insert(hit);
    }
    for (rank, hit) in keyword.iter().enumerate() {
        *scores.entry(hit.id.as_str()).or_insert(0.0) += 1.0 / (RRF_K + (rank + 1) as f64);
        // dense-only metadata is preserved when present
        hits.entry(hit.id.as_str()).or_insert(hit);
    }

    let mut fused: Vec<SearchHit> = scores
        .into_iter()
        .filter_map(|(id, score)| {
            hits.get(id).map(|hit| {
                let mut fused_hit = (*hit).clone();
                fused_hit.score = score;
                fused_hit
            })
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused.truncate(top_k);
    fused
}

/// Assemble the numbered context block and the citation list.
fn build_result(hits: &[SearchHit], multi_document: bool) -> RetrievalResult {
    let mut context = String::new();
    let mut citations = Vec::new();

    for (i, hit) in hits.iter().enumerate() {
        if multi_document {
            context.push_str(&format!(
                "[{}] 【文档：{}】 {}\n\n",
                i + 1,
                hit.metadata.filename,
                hit.content
            ));
        } else {
            context.push_str(&format!("[{}] {}\n\n", i + 1, hit.content));
        }

        if citations.len() < MAX_CITATIONS {
            citations.push(Citation {
                chunk_id: hit.id.clone(),
                document_id: hit.document_id.clone(),
                document_name: if hit.metadata.filename.is_empty() {
                    "未知文档".to_string()
                } else {
                    hit.metadata.filename.clone()
                },
                page_number: if hit.metadata.start_page > 0 {
                    Some(hit.metadata.start_page)
                } else {
                    None
                },
                excerpt: truncate_chars(&hit.content, 300),
                score: hit.score,
            });
        }
    }

    RetrievalResult { context, citations }
}

/// First `max_chars` characters, with an ellipsis when clipped.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn hit(id: &str, score: f64) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            document_id: "d1".to_string(),
            content: format!("content of {id}"),
            score,
            metadata: ChunkMetadata {
                filename: "manual.pdf".into(),
                chunk_index: 0,
                heading: String::new(),
                hierarchy: String::new(),
                start_page: 0,
            },
        }
    }

    #[test]
    fn rrf_merges_in_expected_order() {
        // dense [A, B, C] and keyword [C, A, D] fuse to A, C, B, D
        let dense = vec![hit("A", 0.9), hit("B", 0.8), hit("C", 0.7)];
        let keyword = vec![hit("C", 5.0), hit("A", 4.0), hit("D", 3.0)];

        let fused = rrf_fuse(&dense, &keyword, 4);
        let ids: Vec<&str> = fused.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C", "B", "D"]);

        let expected_a = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].score - expected_a).abs() < 1e-12);
        let expected_c = 1.0 / 63.0 + 1.0 / 61.0;
        assert!((fused[1].score - expected_c).abs() < 1e-12);
    }

    #[test]
    fn rrf_is_commutative() {
        let left = vec![hit("A", 0.9), hit("B", 0.8)];
        let right = vec![hit("B", 2.0), hit("C", 1.0)];

        let one: Vec<String> = rrf_fuse(&left, &right, 10)
            .into_iter()
            .map(|h| h.id)
            .collect();
        let other: Vec<String> = rrf_fuse(&right, &left, 10)
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(one, other);
    }

    #[test]
    fn rrf_with_empty_list_preserves_order() {
        let dense = vec![hit("A", 0.9), hit("B", 0.8), hit("C", 0.7)];
        let fused = rrf_fuse(&dense, &[], 10);
        let ids: Vec<&str> = fused.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn rrf_truncates_to_top_k() {
        let dense: Vec<SearchHit> = (0..10).map(|i| hit(&format!("c{i}"), 1.0)).collect();
        assert_eq!(rrf_fuse(&dense, &[], 3).len(), 3);
    }

    #[test]
    fn context_numbers_hits_and_caps_citations() {
        let hits: Vec<SearchHit> = (0..7).map(|i| hit(&format!("c{i}"), 0.5)).collect();
        let result = build_result(&hits, false);

        assert!(result.context.starts_with("[1] content of c0"));
        assert!(result.context.contains("[7] content of c6"));
        assert!(!result.context.contains("【文档："));
        assert_eq!(result.citations.len(), MAX_CITATIONS);
    }

    #[test]
    fn multi_document_context_carries_filename_tag() {
        let result = build_result(&[hit("c0", 0.5)], true);
        assert!(result.context.contains("【文档：manual.pdf】"));
    }

    #[test]
    fn excerpt_is_char_safe_and_bounded() {
        let mut long_hit = hit("c0", 0.5);
        long_hit.content = "很".repeat(400);
        let result = build_result(&[long_hit], false);
        assert_eq!(result.citations[0].excerpt.chars().count(), 303);
        assert!(result.citations[0].excerpt.ends_with("..."));
    }
}
