//! End-to-end pipeline scenarios: ingest → index → retrieve → chat.
//!
//! Everything runs against an in-memory SQLite database, the in-memory
//! vector store, the deterministic mock embedder, and scripted LLM clients,
//! so the full flow is exercised without any network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use docqa::bm25::Bm25Index;
use docqa::chat::{AskRequest, ChatOrchestrator};
use docqa::config::Config;
use docqa::context::ContextManager;
use docqa::embedding::MockEmbeddingProvider;
use docqa::enrich::ContextualEnricher;
use docqa::error::LlmError;
use docqa::ingest::DocumentService;
use docqa::llm::mock::MockLlmClient;
use docqa::llm::router::LlmRouter;
use docqa::llm::{ChatRequest, LlmClient, TokenStream};
use docqa::models::{DocumentStatus, MessageRole};
use docqa::rag::RagEngine;
use docqa::repo::{ChunkRepo, DocumentRepo, MessageRepo, SessionRepo};
use docqa::vector::{InMemoryVectorStore, VectorStore};
use docqa::{db, migrate};

/// Everything a test needs to drive the service end to end.
struct Harness {
    documents: Arc<DocumentService>,
    rag: Arc<RagEngine>,
    chat: Arc<ChatOrchestrator>,
    document_repo: DocumentRepo,
    chunk_repo: ChunkRepo,
    message_repo: MessageRepo,
    session_repo: SessionRepo,
    vector: Arc<dyn VectorStore>,
    bm25: Arc<Bm25Index>,
    _storage: tempfile::TempDir,
}

async fn harness(
    mut config: Config,
    primary: Arc<dyn LlmClient>,
    fallback: Option<Arc<dyn LlmClient>>,
) -> Harness {
    let storage = tempfile::tempdir().unwrap();
    config.document.storage_path = storage.path().to_path_buf();

    let pool = db::connect_memory().await.unwrap();
    migrate::run(&pool).await.unwrap();

    let config = Arc::new(config);
    let vector: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let bm25 = Arc::new(Bm25Index::new());
    let embedder = Arc::new(MockEmbeddingProvider::new(64));
    let router = Arc::new(LlmRouter::new(primary, fallback));

    let document_repo = DocumentRepo::new(pool.clone());
    let chunk_repo = ChunkRepo::new(pool.clone());
    let session_repo = SessionRepo::new(pool.clone());
    let message_repo = MessageRepo::new(pool.clone());

    let documents = Arc::new(DocumentService::new(
        config.clone(),
        document_repo.clone(),
        chunk_repo.clone(),
        vector.clone(),
        bm25.clone(),
        embedder.clone(),
        Arc::new(ContextualEnricher::new(router.clone())),
    ));
    let rag = Arc::new(RagEngine::new(
        vector.clone(),
        bm25.clone(),
        embedder,
        router.clone(),
        document_repo.clone(),
        chunk_repo.clone(),
        config.rag.clone(),
    ));
    let context = Arc::new(ContextManager::new(
        session_repo.clone(),
        message_repo.clone(),
        router.clone(),
        config.context.clone(),
    ));
    let chat = Arc::new(ChatOrchestrator::new(
        rag.clone(),
        context,
        router,
        config.clone(),
    ));

    Harness {
        documents,
        rag,
        chat,
        document_repo,
        chunk_repo,
        message_repo,
        session_repo,
        vector,
        bm25,
        _storage: storage,
    }
}

fn small_chunk_config() -> Config {
    let mut config = Config::default();
    config.chunking.chunk_size = 500;
    config.chunking.chunk_overlap = 50;
    config.chunking.min_chunk_size = 3;
    config
}

/// Upload and wait for the background pipeline to settle.
async fn ingest(harness: &Harness, filename: &str, body: &str) -> String {
    let document = harness
        .documents
        .clone()
        .upload(filename, body.as_bytes().to_vec(), true)
        .await
        .unwrap();

    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let current = harness
            .document_repo
            .get(&document.id)
            .await
            .unwrap()
            .unwrap();
        match current.status {
            DocumentStatus::Ready => return document.id,
            DocumentStatus::Failed => panic!("ingestion failed"),
            _ => {}
        }
    }
    panic!("ingestion did not settle");
}

// ============ scripted clients ============

/// Streams a scripted list of deltas, optionally dying partway through.
struct ScriptedStreamClient {
    kind: &'static str,
    model: &'static str,
    deltas: Vec<&'static str>,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedStreamClient {
    fn completing(kind: &'static str, model: &'static str, deltas: Vec<&'static str>) -> Self {
        Self {
            kind,
            model,
            deltas,
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_after(
        kind: &'static str,
        model: &'static str,
        deltas: Vec<&'static str>,
        fail_after: usize,
    ) -> Self {
        Self {
            kind,
            model,
            deltas,
            fail_after: Some(fail_after),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedStreamClient {
    fn kind(&self) -> &str {
        self.kind
    }

    fn model_name(&self) -> String {
        self.model.to_string()
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<String, LlmError> {
        Ok("NONE".to_string())
    }

    async fn stream_chat(&self, _request: &ChatRequest) -> Result<TokenStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut items: Vec<Result<String, LlmError>> = self
            .deltas
            .iter()
            .map(|d| Ok::<String, LlmError>(d.to_string()))
            .collect();
        if let Some(after) = self.fail_after {
            items.truncate(after);
            items.push(Err(LlmError::Timeout("scripted stream failure".into())));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Answers every chat with a fixed string (used to script the router).
struct FixedReplyClient {
    reply: &'static str,
}

#[async_trait]
impl LlmClient for FixedReplyClient {
    fn kind(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> String {
        "fixed-model".to_string()
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<String, LlmError> {
        Ok(self.reply.to_string())
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let reply = self.chat(request).await?;
        Ok(futures::stream::iter(vec![Ok(reply)]).boxed())
    }
}

// ============ ingestion properties ============

#[tokio::test]
async fn markdown_small_doc_chunks_and_ranks() {
    let mut config = small_chunk_config();
    config.rag.small_document_threshold = 0; // force real retrieval

    let h = harness(config, Arc::new(MockLlmClient::new()), None).await;
    let doc_id = ingest(
        &h,
        "guide.md",
        "# Intro\n\nHello world.\n\n# Usage\n\nRun it.",
    )
    .await;

    let chunks = h.chunk_repo.list_by_document(&doc_id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].hierarchy.as_deref(), Some("Intro"));
    assert_eq!(chunks[1].hierarchy.as_deref(), Some("Usage"));

    let usage_chunk_id = chunks[1].id.clone();
    let result = h
        .rag
        .retrieve("how to run", &[doc_id])
        .await
        .unwrap();
    assert!(!result.citations.is_empty());
    assert_eq!(result.citations[0].chunk_id, usage_chunk_id);
}

#[tokio::test]
async fn indices_stay_aligned_and_delete_cascades() {
    let h = harness(small_chunk_config(), Arc::new(MockLlmClient::new()), None).await;
    let doc_id = ingest(
        &h,
        "aligned.md",
        "# One\n\nfirst section body text.\n\n# Two\n\nsecond section body text.\n\n# Three\n\nthird section body text.",
    )
    .await;

    let document = h.document_repo.get(&doc_id).await.unwrap().unwrap();
    let repo_count = h.chunk_repo.count(&doc_id).await.unwrap() as usize;
    assert_eq!(document.chunk_count as usize, repo_count);
    assert_eq!(h.vector.count_for_document(&doc_id).await.unwrap(), repo_count);
    assert_eq!(h.bm25.chunk_count(&doc_id), repo_count);

    h.documents.delete(&doc_id).await.unwrap();
    assert!(h.document_repo.get(&doc_id).await.unwrap().is_none());
    assert_eq!(h.chunk_repo.count(&doc_id).await.unwrap(), 0);
    assert_eq!(h.vector.count_for_document(&doc_id).await.unwrap(), 0);
    assert_eq!(h.bm25.chunk_count(&doc_id), 0);
}

#[tokio::test]
async fn reindex_rebuilds_secondary_indices() {
    let h = harness(small_chunk_config(), Arc::new(MockLlmClient::new()), None).await;
    let doc_id = ingest(&h, "re.md", "# A\n\nalpha body text here.").await;

    let before = h.vector.count_for_document(&doc_id).await.unwrap();
    assert!(before > 0);

    h.documents.reindex(&doc_id).await.unwrap();
    assert_eq!(h.vector.count_for_document(&doc_id).await.unwrap(), before);
    assert_eq!(h.bm25.chunk_count(&doc_id), before);
}

#[tokio::test]
async fn unsupported_and_oversized_uploads_are_rejected() {
    let mut config = small_chunk_config();
    config.document.max_file_size = 64;
    let h = harness(config, Arc::new(MockLlmClient::new()), None).await;

    let unsupported = h
        .documents
        .clone()
        .upload("evil.exe", b"MZ".to_vec(), true)
        .await;
    assert!(unsupported.is_err());

    let oversized = h
        .documents
        .clone()
        .upload("big.txt", vec![b'x'; 1000], true)
        .await;
    assert!(oversized.is_err());
}

// ============ retrieval scenarios ============

#[tokio::test]
async fn small_document_shortcut_returns_full_text() {
    let h = harness(small_chunk_config(), Arc::new(MockLlmClient::new()), None).await;
    let doc_id = ingest(
        &h,
        "tiny.md",
        "# A\n\nfirst part.\n\n# B\n\nsecond part.\n\n# C\n\nthird part.",
    )
    .await;

    let result = h.rag.retrieve("anything at all", &[doc_id]).await.unwrap();
    assert!(result.context.contains("first part."));
    assert!(result.context.contains("third part."));
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].chunk_id, "full-document");
    assert_eq!(result.citations[0].document_name, "tiny.md");
}

#[tokio::test]
async fn hierarchy_prediction_falls_back_to_document_wide_search() {
    let mut config = small_chunk_config();
    config.rag.small_document_threshold = 0;
    config.rag.top_k = 4;

    // the router's model always answers "1.1", steering dense search into
    // a one-chunk section; the thin result forces the global fallback
    let h = harness(config, Arc::new(FixedReplyClient { reply: "1.1" }), None).await;
    let doc_id = ingest(
        &h,
        "sections.md",
        "## 1. Setup\n\ngeneral setup information goes here.\n\n\
         ### 1.1 Install\n\ninstallation steps for the tool.\n\n\
         ### 1.2 Config\n\nconfiguration keys and values explained.",
    )
    .await;

    let result = h
        .rag
        .retrieve("configuration keys", &[doc_id.clone()])
        .await
        .unwrap();

    // fallback searched the whole document, so sections outside 1.1 appear
    let chunks = h.chunk_repo.list_by_document(&doc_id).await.unwrap();
    let config_chunk = chunks
        .iter()
        .find(|c| c.hierarchy.as_deref() == Some("1. Setup > 1.2 Config"))
        .unwrap();
    assert!(result
        .citations
        .iter()
        .any(|c| c.chunk_id == config_chunk.id));
}

// ============ chat scenarios ============

#[tokio::test]
async fn streamed_answer_ends_with_single_terminal_frame() {
    let h = harness(small_chunk_config(), Arc::new(MockLlmClient::new()), None).await;
    let doc_id = ingest(&h, "doc.md", "# T\n\nsome document body.").await;
    let session = h.session_repo.create(Some(&doc_id)).await.unwrap();

    let mut stream = h.chat.clone().stream_answer(AskRequest {
        query: "什么内容？".into(),
        session_id: session.id.clone(),
        document_id: None,
        model_type: None,
    });

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame);
    }

    let terminal_count = frames.iter().filter(|f| f.complete).count();
    assert_eq!(terminal_count, 1);
    assert!(frames.last().unwrap().complete);
    for frame in &frames[..frames.len() - 1] {
        assert!(!frame.content.is_empty());
        assert!(frame.error.is_none());
    }
    // terminal frame carries the citations and no content
    let terminal = frames.last().unwrap();
    assert!(terminal.content.is_empty());
    assert_eq!(terminal.citations.as_ref().unwrap().len(), 1);

    // both turns persisted
    let messages = h.message_repo.list_ascending(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
}

#[tokio::test]
async fn primary_failure_falls_over_with_warning_and_no_delta_loss() {
    let primary = Arc::new(ScriptedStreamClient::failing_after(
        "azure",
        "primary-model",
        vec!["Hel"],
        1,
    ));
    let fallback = Arc::new(ScriptedStreamClient::completing(
        "dashscope",
        "fallback-model",
        vec!["lo", " world"],
    ));

    let h = harness(
        small_chunk_config(),
        primary.clone(),
        Some(fallback.clone()),
    )
    .await;
    let doc_id = ingest(&h, "doc.md", "# T\n\ndocument body for grounding.").await;
    let session = h.session_repo.create(Some(&doc_id)).await.unwrap();

    let mut stream = h.chat.clone().stream_answer(AskRequest {
        query: "hello?".into(),
        session_id: session.id.clone(),
        document_id: None,
        model_type: None,
    });

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame);
    }

    // delta, warning naming both models, fallback deltas, terminal
    assert_eq!(frames[0].content, "Hel");
    let warning = frames[1].warning.as_ref().unwrap();
    assert!(warning.contains("primary-model"));
    assert!(warning.contains("fallback-model"));
    assert_eq!(frames[2].content, "lo");
    assert_eq!(frames[3].content, " world");
    assert!(frames[4].complete);
    assert!(frames[4].citations.is_some());
    assert_eq!(frames.len(), 5);

    // the assistant turn contains every delta from both streams
    let messages = h.message_repo.list_ascending(&session.id).await.unwrap();
    let assistant = messages
        .iter()
        .find(|m| m.role == MessageRole::Assistant)
        .unwrap();
    assert_eq!(assistant.content, "Hello world");

    // each client was streamed exactly once
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn both_models_failing_yields_terminal_error() {
    let primary = Arc::new(ScriptedStreamClient::failing_after(
        "azure",
        "primary-model",
        vec![],
        0,
    ));
    let fallback = Arc::new(ScriptedStreamClient::failing_after(
        "dashscope",
        "fallback-model",
        vec![],
        0,
    ));

    let h = harness(small_chunk_config(), primary, Some(fallback)).await;
    let session = h.session_repo.create(None).await.unwrap();

    let mut stream = h.chat.clone().stream_answer(AskRequest {
        query: "hello?".into(),
        session_id: session.id,
        document_id: None,
        model_type: None,
    });

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame);
    }

    // warning frame, then one terminal frame carrying the error
    let terminal = frames.last().unwrap();
    assert!(terminal.complete);
    assert!(terminal.error.is_some());
    assert_eq!(frames.iter().filter(|f| f.complete).count(), 1);
}

#[tokio::test]
async fn synchronous_answer_returns_citations() {
    let h = harness(small_chunk_config(), Arc::new(MockLlmClient::new()), None).await;
    let doc_id = ingest(&h, "doc.md", "# T\n\nanswerable document body.").await;
    let session = h.session_repo.create(None).await.unwrap();

    let chunk = h
        .chat
        .answer(AskRequest {
            query: "查询内容".into(),
            session_id: session.id,
            document_id: Some(doc_id),
            model_type: None,
        })
        .await;

    assert!(chunk.complete);
    assert!(chunk.error.is_none());
    assert!(!chunk.content.is_empty());
    assert_eq!(chunk.citations.as_ref().unwrap().len(), 1);
}
