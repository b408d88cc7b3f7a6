//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/documents` | multipart upload (`file` field, `skipEnrichment` query) |
//! | `GET`  | `/api/documents` | list documents |
//! | `GET`  | `/api/documents/{id}` | one document, including full text |
//! | `GET`  | `/api/documents/{id}/content` | canonical text only |
//! | `GET`  | `/api/documents/{id}/chunks` | ordered chunk list |
//! | `POST` | `/api/documents/{id}/reindex` | rebuild vector + BM25 indices |
//! | `DELETE` | `/api/documents/{id}` | delete with cascade |
//! | `POST` | `/api/chat/sessions` | create a session (`{documentId}`) |
//! | `POST` | `/api/chat` | synchronous answer |
//! | `GET`  | `/api/chat/stream` | SSE answer stream |
//! | `GET`  | `/health` | liveness probe |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "DOCUMENT_PROCESS_ERROR", "message": "..." } }
//! ```
//!
//! Processing failures map to 422, invalid arguments to 400, oversized
//! uploads to 413; LLM failures map by kind (429 rate limit, 401 auth,
//! 400 invalid request, 503 for timeout/network/service).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};

use crate::bm25::Bm25Index;
use crate::chat::{AskRequest, ChatOrchestrator};
use crate::config::Config;
use crate::context::ContextManager;
use crate::embedding::create_provider;
use crate::enrich::ContextualEnricher;
use crate::error::{DocError, LlmError};
use crate::ingest::DocumentService;
use crate::llm::router::LlmRouter;
use crate::llm::build_client;
use crate::models::{ChatChunk, ChatSession, ChunkDto, DocumentDto};
use crate::rag::RagEngine;
use crate::repo::{ChunkRepo, DocumentRepo, MessageRepo, SessionRepo};
use crate::vector::create_vector_store;
use crate::{db, migrate};

/// Shared application state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub documents: Arc<DocumentService>,
    pub chat: Arc<ChatOrchestrator>,
}

/// Wire the full service graph onto a fresh database connection.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run(&pool).await?;
    build_state_with_pool(Arc::new(config), pool)
}

/// Wire the service graph onto an existing pool (tests use `:memory:`).
pub fn build_state_with_pool(config: Arc<Config>, pool: SqlitePool) -> anyhow::Result<AppState> {
    let vector = create_vector_store(&config.vector)?;
    let bm25 = Arc::new(Bm25Index::new());
    let embedder = create_provider(&config.embedding)?;

    let primary = build_client(&config.llm.primary, &config.llm.retry)?;
    let fallback_config = &config.llm.fallback;
    let same_as_primary = fallback_config.kind == config.llm.primary.kind
        && fallback_config.model == config.llm.primary.model
        && fallback_config.endpoint == config.llm.primary.endpoint;
    let fallback = if fallback_config.is_enabled() && !same_as_primary {
        Some(build_client(fallback_config, &config.llm.retry)?)
    } else {
        None
    };
    let router = Arc::new(LlmRouter::new(primary, fallback));

    let enricher = Arc::new(ContextualEnricher::new(router.clone()));
    let document_repo = DocumentRepo::new(pool.clone());
    let chunk_repo = ChunkRepo::new(pool.clone());

    let documents = Arc::new(DocumentService::new(
        config.clone(),
        document_repo.clone(),
        chunk_repo.clone(),
        vector.clone(),
        bm25.clone(),
        embedder.clone(),
        enricher,
    ));

    let rag = Arc::new(RagEngine::new(
        vector,
        bm25,
        embedder,
        router.clone(),
        document_repo,
        chunk_repo,
        config.rag.clone(),
    ));
    let context = Arc::new(ContextManager::new(
        SessionRepo::new(pool.clone()),
        MessageRepo::new(pool),
        router.clone(),
        config.context.clone(),
    ));
    let chat = Arc::new(ChatOrchestrator::new(rag, context, router, config.clone()));

    Ok(AppState {
        config,
        documents,
        chat,
    })
}

/// Build the router and serve until terminated.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();
    let app = build_router(state);

    tracing::info!(addr = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Assemble routes, body limits, and CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // leave headroom above the configured limit so the 413 mapping is ours
    let body_limit = state.config.document.max_file_size as usize + 1024 * 1024;

    Router::new()
        .route("/api/documents", post(upload_document).get(list_documents))
        .route(
            "/api/documents/{id}",
            get(get_document).delete(delete_document),
        )
        .route("/api/documents/{id}/content", get(get_document_content))
        .route("/api/documents/{id}/chunks", get(get_document_chunks))
        .route("/api/documents/{id}/reindex", post(reindex_document))
        .route("/api/chat/sessions", post(create_session))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", get(chat_stream))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

// ============ error mapping ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Route-level error that renders the JSON error contract.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn from_doc(error: &DocError) -> Self {
        match error {
            DocError::Process(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "DOCUMENT_PROCESS_ERROR",
                error.to_string(),
            ),
            DocError::InvalidArgument(_) => Self::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                error.to_string(),
            ),
            DocError::FileTooLarge { .. } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "FILE_TOO_LARGE",
                error.to_string(),
            ),
        }
    }

    fn from_llm(error: &LlmError) -> Self {
        let status = match error {
            LlmError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            LlmError::Auth(_) => StatusCode::UNAUTHORIZED,
            LlmError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            LlmError::Timeout(_) | LlmError::Network(_) | LlmError::Service(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, "LLM_ERROR", error.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        if let Some(doc) = error.downcast_ref::<DocError>() {
            return Self::from_doc(doc);
        }
        if let Some(llm) = error.downcast_ref::<LlmError>() {
            return Self::from_llm(llm);
        }
        tracing::error!(error = %error, "unhandled internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            error.to_string(),
        )
    }
}

impl From<DocError> for AppError {
    fn from(error: DocError) -> Self {
        Self::from_doc(&error)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ documents ============

#[derive(Deserialize, Default)]
struct UploadParams {
    #[serde(default, rename = "skipEnrichment")]
    skip_enrichment: bool,
}

async fn upload_document(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<DocumentDto>, AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::from(DocError::InvalidArgument(format!("invalid multipart body: {e}")))
    })? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let bytes = field.bytes().await.map_err(|e| {
                AppError::from(DocError::InvalidArgument(format!(
                    "failed to read upload: {e}"
                )))
            })?;
            upload = Some((filename, bytes.to_vec()));
            break;
        }
    }

    let (filename, bytes) =
        upload.ok_or_else(|| AppError::from(DocError::InvalidArgument("missing 'file' field".into())))?;

    let document = state
        .documents
        .clone()
        .upload(&filename, bytes, params.skip_enrichment)
        .await?;
    Ok(Json(DocumentDto::from_document(&document, false)))
}

async fn list_documents(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentDto>>, AppError> {
    let documents = state.documents.list_documents().await?;
    Ok(Json(
        documents
            .iter()
            .map(|d| DocumentDto::from_document(d, false))
            .collect(),
    ))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentDto>, AppError> {
    let document = state.documents.get_document(&id).await?;
    Ok(Json(DocumentDto::from_document(&document, true)))
}

#[derive(Serialize)]
struct ContentResponse {
    content: String,
}

async fn get_document_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContentResponse>, AppError> {
    let document = state.documents.get_document(&id).await?;
    Ok(Json(ContentResponse {
        content: document.full_text.unwrap_or_default(),
    }))
}

async fn get_document_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChunkDto>>, AppError> {
    let chunks = state.documents.document_chunks(&id).await?;
    Ok(Json(chunks.iter().map(ChunkDto::from).collect()))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.documents.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reindex_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.documents.reindex(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ============ chat ============

#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(default, rename = "documentId")]
    document_id: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<ChatSession>, AppError> {
    let session = state
        .chat
        .create_session(request.document_id.as_deref())
        .await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
struct ChatRequestBody {
    query: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(default, rename = "documentId")]
    document_id: Option<String>,
    #[serde(default, rename = "modelType")]
    model_type: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequestBody>,
) -> Result<Json<ChatChunk>, AppError> {
    if request.query.trim().is_empty() {
        return Err(DocError::InvalidArgument("query must not be empty".into()).into());
    }

    let chunk = state
        .chat
        .answer(AskRequest {
            query: request.query,
            session_id: request.session_id,
            document_id: request.document_id,
            model_type: request.model_type,
        })
        .await;
    Ok(Json(chunk))
}

#[derive(Deserialize)]
struct StreamParams {
    query: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(default, rename = "documentId")]
    document_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn chat_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if params.query.trim().is_empty() {
        return Err(DocError::InvalidArgument("query must not be empty".into()).into());
    }

    let chunks = state.chat.clone().stream_answer(AskRequest {
        query: params.query,
        session_id: params.session_id,
        document_id: params.document_id,
        model_type: params.model,
    });

    let events = chunks.map(|chunk| {
        let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_error_status_mapping() {
        let process = AppError::from_doc(&DocError::Process("bad".into()));
        assert_eq!(process.status, StatusCode::UNPROCESSABLE_ENTITY);

        let invalid = AppError::from_doc(&DocError::InvalidArgument("bad".into()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let too_large = AppError::from_doc(&DocError::FileTooLarge { size: 2, limit: 1 });
        assert_eq!(too_large.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(too_large.code, "FILE_TOO_LARGE");
    }

    #[test]
    fn llm_error_status_mapping() {
        assert_eq!(
            AppError::from_llm(&LlmError::RateLimit("x".into())).status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::from_llm(&LlmError::Auth("x".into())).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from_llm(&LlmError::Timeout("x".into())).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from_llm(&LlmError::InvalidRequest("x".into())).status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn anyhow_downcast_recovers_taxonomy() {
        let wrapped: anyhow::Error = DocError::FileTooLarge { size: 9, limit: 1 }.into();
        let mapped = AppError::from(wrapped);
        assert_eq!(mapped.status, StatusCode::PAYLOAD_TOO_LARGE);

        let opaque = anyhow::anyhow!("boom");
        assert_eq!(AppError::from(opaque).status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
