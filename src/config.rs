//! TOML configuration parsing and validation.
//!
//! All runtime settings are read from one TOML file (default:
//! `config/docqa.toml`). Every section has serde defaults so a minimal file
//! (or none of a section) yields a working development setup with the mock
//! embedding and LLM providers.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub rag: RagConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docqa.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Upload handling: where files land and what is accepted.
#[derive(Debug, Deserialize, Clone)]
pub struct DocumentConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Maximum upload size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Comma-separated list of accepted file extensions.
    #[serde(default = "default_allowed_types")]
    pub allowed_types: String,
}

impl DocumentConfig {
    /// Accepted extensions, lowercased and trimmed.
    pub fn allowed_type_list(&self) -> Vec<String> {
        self.allowed_types
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            max_file_size: default_max_file_size(),
            allowed_types: default_allowed_types(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_allowed_types() -> String {
    "pdf,md,markdown,txt".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters carried over from the end of one chunk into the next.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Chunks shorter than this are dropped rather than emitted.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_min_chunk_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// Backend selector: `memory` or `milvus`.
    #[serde(default = "default_vector_type", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub milvus: MilvusConfig,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            kind: default_vector_type(),
            milvus: MilvusConfig::default(),
        }
    }
}

fn default_vector_type() -> String {
    "memory".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MilvusConfig {
    #[serde(default = "default_milvus_host")]
    pub host: String,
    #[serde(default = "default_milvus_port")]
    pub port: u16,
    #[serde(default = "default_milvus_collection")]
    pub collection: String,
    #[serde(default = "default_milvus_dimension")]
    pub dimension: usize,
}

impl Default for MilvusConfig {
    fn default() -> Self {
        Self {
            host: default_milvus_host(),
            port: default_milvus_port(),
            collection: default_milvus_collection(),
            dimension: default_milvus_dimension(),
        }
    }
}

fn default_milvus_host() -> String {
    "localhost".to_string()
}
fn default_milvus_port() -> u16 {
    19530
}
fn default_milvus_collection() -> String {
    "document_chunks".to_string()
}
fn default_milvus_dimension() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Provider selector: `mock`, `openai`, `azure`, or `dashscope`.
    #[serde(default = "default_embedding_type", rename = "type")]
    pub kind: String,
    /// Vector dimensionality produced by the provider.
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Maximum texts per provider request.
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub openai: ProviderCredentials,
    #[serde(default)]
    pub azure: ProviderCredentials,
    #[serde(default)]
    pub dashscope: ProviderCredentials,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: default_embedding_type(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            openai: ProviderCredentials::default(),
            azure: ProviderCredentials::default(),
            dashscope: ProviderCredentials::default(),
        }
    }
}

fn default_embedding_type() -> String {
    "mock".to_string()
}
fn default_embedding_dimension() -> usize {
    1536
}
fn default_embedding_batch_size() -> usize {
    16
}

/// Credentials for one embedding provider.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Azure resource endpoint; unused by the other providers.
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub primary: ModelConfig,
    #[serde(default)]
    pub fallback: ModelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// One chat model endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Client selector: `mock`, `openai`, `azure`, `dashscope`, or `none`.
    #[serde(default = "default_model_type", rename = "type")]
    pub kind: String,
    /// Wire format: `chat` (Chat Completions) or `responses`.
    #[serde(default = "default_api_type")]
    pub api_type: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Full request URL for Azure-style deployments.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_version: String,
    /// Read timeout in milliseconds.
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        !self.kind.is_empty() && self.kind != "none"
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_model_type(),
            api_type: default_api_type(),
            api_key: String::new(),
            model: String::new(),
            endpoint: String::new(),
            api_version: String::new(),
            timeout: default_llm_timeout_ms(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

fn default_model_type() -> String {
    "mock".to_string()
}
fn default_api_type() -> String {
    "chat".to_string()
}
fn default_llm_timeout_ms() -> u64 {
    60_000
}
fn default_llm_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
            multiplier: default_retry_multiplier(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_retry_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Conversation rounds kept verbatim when history is compacted.
    #[serde(default = "default_max_history_rounds")]
    pub max_history_rounds: usize,
    /// Overall token budget for prompt assembly.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Compaction triggers once message_count reaches twice this value.
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history_rounds: default_max_history_rounds(),
            max_context_tokens: default_max_context_tokens(),
            summary_threshold: default_summary_threshold(),
        }
    }
}

fn default_max_history_rounds() -> usize {
    10
}
fn default_max_context_tokens() -> usize {
    4000
}
fn default_summary_threshold() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Dense-score floor used by the hierarchy fallback heuristic.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Enables LLM-generated locator prefixes during ingestion.
    #[serde(default)]
    pub contextual_retrieval_enabled: bool,
    /// Documents at or below this chunk count skip retrieval entirely.
    #[serde(default = "default_small_document_threshold")]
    pub small_document_threshold: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            contextual_retrieval_enabled: false,
            small_document_threshold: default_small_document_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_small_document_threshold() -> usize {
    10
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Validate a configuration tree.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }
    if config.document.allowed_type_list().is_empty() {
        anyhow::bail!("document.allowed_types must list at least one extension");
    }

    match config.vector.kind.as_str() {
        "memory" | "milvus" => {}
        other => anyhow::bail!(
            "Unknown vector backend: '{}'. Must be memory or milvus.",
            other
        ),
    }

    match config.embedding.kind.as_str() {
        "mock" | "openai" | "azure" | "dashscope" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be mock, openai, azure, or dashscope.",
            other
        ),
    }
    if config.embedding.dimension == 0 {
        anyhow::bail!("embedding.dimension must be > 0");
    }

    if !config.llm.primary.is_enabled() {
        anyhow::bail!("llm.primary.type must be configured");
    }
    if config.rag.top_k == 0 {
        anyhow::bail!("rag.top_k must be >= 1");
    }
    if config.context.summary_threshold == 0 {
        anyhow::bail!("context.summary_threshold must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.embedding.kind, "mock");
        assert_eq!(config.llm.primary.kind, "mock");
    }

    #[test]
    fn parses_minimal_file() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            chunk_size = 300
            chunk_overlap = 30
            min_chunk_size = 10

            [llm.primary]
            type = "openai"
            model = "gpt-4o-mini"
            api_key = "sk-test"
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 300);
        assert_eq!(config.llm.primary.kind, "openai");
        assert_eq!(config.llm.fallback.kind, "mock");
    }

    #[test]
    fn rejects_unknown_vector_backend() {
        let config: Config = toml::from_str("[vector]\ntype = \"faiss\"\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_overlap_ge_chunk_size() {
        let config: Config = toml::from_str(
            "[chunking]\nchunk_size = 100\nchunk_overlap = 100\nmin_chunk_size = 5\n",
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn allowed_types_are_normalized() {
        let config: Config =
            toml::from_str("[document]\nallowed_types = \" PDF, md ,txt \"\n").unwrap();
        assert_eq!(
            config.document.allowed_type_list(),
            vec!["pdf", "md", "txt"]
        );
    }
}
