//! Error types shared across the service.
//!
//! Two families exist: [`DocError`] covers upload validation and document
//! processing, [`LlmError`] covers everything a model provider can do wrong.
//! HTTP status mapping lives with the server layer; these types only carry
//! the classification.

use reqwest::StatusCode;

/// Errors raised while validating or processing an uploaded document.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    /// Parsing or pipeline failure for a document that was accepted.
    #[error("document processing failed: {0}")]
    Process(String),

    /// A request argument the caller can fix (unknown id, empty field).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Upload exceeds the configured size limit.
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },
}

/// Errors from LLM and embedding provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by provider: {0}")]
    RateLimit(String),

    #[error("provider request timed out: {0}")]
    Timeout(String),

    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("provider network error: {0}")]
    Network(String),

    #[error("invalid provider request: {0}")]
    InvalidRequest(String),

    #[error("provider service error: {0}")]
    Service(String),
}

impl LlmError {
    /// Classify a non-success HTTP response from a provider.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {status}: {body}");
        match status.as_u16() {
            401 | 403 => LlmError::Auth(detail),
            429 => LlmError::RateLimit(detail),
            408 | 504 => LlmError::Timeout(detail),
            500..=599 => LlmError::Service(detail),
            _ => LlmError::InvalidRequest(detail),
        }
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::Network(err.to_string())
        }
    }

    /// Whether a retry with backoff is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit(_) | LlmError::Service(_) | LlmError::Network(_)
        )
    }
}
