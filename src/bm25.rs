//! Per-document BM25 inverted index.
//!
//! Keyword companion to the dense vector store. Each document gets its own
//! inverted table (term frequencies per chunk plus an average chunk length),
//! so scoring statistics never leak across documents and a document's index
//! can be dropped in one operation.
//!
//! Tokenization is CJK-aware: every ideograph in U+4E00..U+9FA5 is its own
//! token, runs of letters/digits form one lowercased token, and everything
//! else delimits.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::models::{ChunkMetadata, SearchHit};
use crate::token::is_cjk;

/// Term-frequency saturation parameter.
const K1: f64 = 1.2;
/// Length normalization parameter.
const B: f64 = 0.75;

/// Input row for indexing: one chunk's indexable content plus metadata.
#[derive(Debug, Clone)]
pub struct Bm25Chunk {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

struct ChunkEntry {
    id: String,
    content: String,
    metadata: ChunkMetadata,
    term_freq: HashMap<String, u32>,
    length: usize,
}

struct DocIndex {
    chunks: Vec<ChunkEntry>,
    avg_length: f64,
}

/// Thread-safe BM25 index keyed by document id.
pub struct Bm25Index {
    documents: RwLock<HashMap<String, DocIndex>>,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the index for one document.
    pub fn index_chunks(&self, document_id: &str, chunks: Vec<Bm25Chunk>) {
        if chunks.is_empty() {
            return;
        }

        let mut entries = Vec::with_capacity(chunks.len());
        let mut total_length = 0usize;

        for chunk in chunks {
            let tokens = tokenize(&chunk.content);
            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            total_length += tokens.len();
            entries.push(ChunkEntry {
                id: chunk.id,
                content: chunk.content,
                metadata: chunk.metadata,
                term_freq,
                length: tokens.len(),
            });
        }

        let avg_length = total_length as f64 / entries.len() as f64;
        let mut documents = self.documents.write().expect("bm25 lock poisoned");
        documents.insert(
            document_id.to_string(),
            DocIndex {
                chunks: entries,
                avg_length,
            },
        );
        tracing::info!(document_id, "BM25 index built");
    }

    /// Score one document's chunks against the query, best first.
    pub fn search(&self, query: &str, document_id: &str, top_k: usize) -> Vec<SearchHit> {
        let documents = self.documents.read().expect("bm25 lock poisoned");
        let doc = match documents.get(document_id) {
            Some(doc) => doc,
            None => {
                tracing::warn!(document_id, "BM25: no index for document");
                return Vec::new();
            }
        };

        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let distinct_terms: HashSet<&String> = query_tokens.iter().collect();

        let n = doc.chunks.len() as f64;
        let avg_len = if doc.avg_length > 0.0 {
            doc.avg_length
        } else {
            100.0
        };

        // idf per distinct query term
        let mut idf: HashMap<&String, f64> = HashMap::new();
        for term in &distinct_terms {
            let df = doc
                .chunks
                .iter()
                .filter(|c| c.term_freq.contains_key(*term))
                .count() as f64;
            idf.insert(*term, ((n - df + 0.5) / (df + 0.5) + 1.0).ln());
        }

        let mut hits: Vec<SearchHit> = doc
            .chunks
            .iter()
            .filter_map(|chunk| {
                let mut score = 0.0;
                for term in &query_tokens {
                    let tf = *chunk.term_freq.get(term).unwrap_or(&0) as f64;
                    if tf > 0.0 {
                        let idf_value = idf.get(term).copied().unwrap_or(0.0);
                        let numerator = tf * (K1 + 1.0);
                        let denominator =
                            tf + K1 * (1.0 - B + B * chunk.length as f64 / avg_len);
                        score += idf_value * numerator / denominator;
                    }
                }
                if score > 0.0 {
                    Some(SearchHit {
                        id: chunk.id.clone(),
                        document_id: document_id.to_string(),
                        content: chunk.content.clone(),
                        score,
                        metadata: chunk.metadata.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        hits
    }

    /// Search several documents and merge: each document is searched with a
    /// widened per-document limit, results are deduped by chunk id, sorted,
    /// and truncated.
    pub fn search_multi(&self, query: &str, document_ids: &[String], top_k: usize) -> Vec<SearchHit> {
        if document_ids.is_empty() {
            return Vec::new();
        }

        let per_doc = top_k.max(5);
        let mut merged: Vec<SearchHit> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for doc_id in document_ids {
            for hit in self.search(query, doc_id, per_doc) {
                if seen.insert(hit.id.clone()) {
                    merged.push(hit);
                }
            }
        }

        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(top_k);
        merged
    }

    /// Drop one document's index.
    pub fn delete_by_document(&self, document_id: &str) {
        let mut documents = self.documents.write().expect("bm25 lock poisoned");
        documents.remove(document_id);
        tracing::debug!(document_id, "BM25 index deleted");
    }

    /// Number of chunks indexed for a document.
    pub fn chunk_count(&self, document_id: &str) -> usize {
        let documents = self.documents.read().expect("bm25 lock poisoned");
        documents.get(document_id).map_or(0, |d| d.chunks.len())
    }
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase tokenizer: CJK ideographs one token each, alnum runs one token.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    for c in text.to_lowercase().chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            word.push(c);
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }

    tokens
}
