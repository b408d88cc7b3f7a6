//! # docqa
//!
//! **A document question-answering service built on hybrid
//! retrieval-augmented generation.**
//!
//! Users upload PDF / Markdown / plain-text documents; docqa parses,
//! segments, and doubly indexes them (dense vectors + BM25), then answers
//! questions over them with a streaming LLM chat that cites its sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌───────────────┐
//! │  Upload  │──▶│  Parse → Chunk → Enrich    │──▶│ SQLite (rows)  │
//! │ PDF/MD/TXT│  │        → Embed             │   │ Vector + BM25  │
//! └──────────┘   └───────────────────────────┘   └───────┬───────┘
//!                                                        │
//!                       ┌────────────────────────────────┤
//!                       ▼                                ▼
//!                ┌─────────────┐                  ┌─────────────┐
//!                │ RAG engine  │────────────────▶│  Chat (SSE)  │
//!                │ dense+BM25  │  context+cites  │  + fallback  │
//!                └─────────────┘                  └─────────────┘
//! ```
//!
//! ## Query flow
//!
//! 1. Small documents skip retrieval and ship their full text.
//! 2. Short queries are LLM-expanded (concatenated, never replaced).
//! 3. The router predicts a section hierarchy to pre-filter dense search,
//!    falling back to a document-wide pass when results are thin.
//! 4. BM25 runs on the original query; both lists merge via Reciprocal
//!    Rank Fusion (K = 60).
//! 5. The orchestrator streams the grounded answer, switching to the
//!    fallback model on failure, and ends with one citation-bearing frame.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Entities, retrieval types, HTTP DTOs |
//! | [`error`] | Document and LLM error taxonomy |
//! | [`token`] | Heuristic token estimation |
//! | [`parse`] | PDF and Markdown/TXT parsers |
//! | [`chunker`] | Heading-aware two-stage chunker |
//! | [`enrich`] | Contextual locator prefixes |
//! | [`embedding`] | Embedding providers (mock/openai/azure/dashscope) |
//! | [`vector`] | Vector store trait + in-memory cosine backend |
//! | [`bm25`] | Per-document BM25 inverted index |
//! | [`llm`] | LLM clients, streaming, router |
//! | [`rag`] | Hybrid retrieval engine with RRF fusion |
//! | [`context`] | Session history and summarisation compaction |
//! | [`chat`] | Answer orchestration with fallback |
//! | [`ingest`] | Upload validation and the ingestion pipeline |
//! | [`repo`] | SQLite repositories |
//! | [`db`] / [`migrate`] | Pool setup and schema |
//! | [`server`] | Axum HTTP API with SSE streaming |

pub mod bm25;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod rag;
pub mod repo;
pub mod server;
pub mod token;
pub mod vector;
