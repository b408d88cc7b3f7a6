//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and four backends:
//!
//! | Config value | Provider | Endpoint |
//! |--------------|----------|----------|
//! | `mock` | [`MockEmbeddingProvider`] | none (deterministic hash vectors) |
//! | `openai` | [`OpenAiEmbeddingProvider`] | `POST /v1/embeddings` |
//! | `azure` | [`AzureEmbeddingProvider`] | deployment endpoint, `api-key` header |
//! | `dashscope` | [`DashScopeEmbeddingProvider`] | text-embedding service |
//!
//! Batch requests are capped two ways before they reach a provider: at most
//! `batch_size` texts per call, and at most [`MAX_CHARS_PER_BATCH`] total
//! characters, which keeps CJK-heavy batches under provider token limits.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Character budget per provider request; CJK text runs roughly 1.5–2
/// tokens per character, so this stays well under typical input limits.
const MAX_CHARS_PER_BATCH: usize = 2000;

/// Trait for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider identifier (`"mock"`, `"openai"`, ...).
    fn kind(&self) -> &str;

    /// Vector dimensionality; every produced embedding has this length.
    fn dims(&self) -> usize;

    /// Embed one batch of texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_batch(&[text.to_string()]).await?;
        result
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }
}

/// Instantiate the configured provider.
pub fn create_provider(config: &EmbeddingConfig) -> Result<std::sync::Arc<dyn EmbeddingProvider>> {
    match config.kind.as_str() {
        "mock" => Ok(std::sync::Arc::new(MockEmbeddingProvider::new(
            config.dimension,
        ))),
        "openai" => Ok(std::sync::Arc::new(OpenAiEmbeddingProvider::new(config)?)),
        "azure" => Ok(std::sync::Arc::new(AzureEmbeddingProvider::new(config)?)),
        "dashscope" => Ok(std::sync::Arc::new(DashScopeEmbeddingProvider::new(
            config,
        )?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Split texts into provider-sized batches: at most `batch_size` items and
/// [`MAX_CHARS_PER_BATCH`] characters each (single oversized texts go alone).
fn partition_batches(texts: &[String], batch_size: usize) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_chars = 0usize;

    for text in texts {
        let chars = text.chars().count();
        let over_budget = !current.is_empty()
            && (current_chars + chars > MAX_CHARS_PER_BATCH || current.len() >= batch_size);
        if over_budget {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += chars;
        current.push(text.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ============ Mock ============

/// Deterministic provider for development and tests.
///
/// Vectors are derived from token hashes, so identical texts embed
/// identically and texts sharing words land near each other — enough
/// structure for cosine ranking to behave meaningfully offline.
pub struct MockEmbeddingProvider {
    dims: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in crate::bm25::tokenize(text) {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
            for b in token.as_bytes() {
                hash ^= *b as u64;
                hash = hash.wrapping_mul(0x1000_0000_01b3);
            }
            let slot = (hash % self.dims as u64) as usize;
            vector[slot] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn kind(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI ============

/// OpenAI embeddings API provider.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.openai.api_key.is_empty() {
            bail!("embedding.openai.api_key is required");
        }
        let model = if config.openai.model.is_empty() {
            "text-embedding-3-small".to_string()
        } else {
            config.openai.model.clone()
        };
        Ok(Self {
            client: http_client()?,
            api_key: config.openai.api_key.clone(),
            model,
            dims: config.dimension,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn kind(&self) -> &str {
        "openai"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in partition_batches(texts, self.batch_size) {
            let response = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&json!({ "model": self.model, "input": batch }))
                .send()
                .await
                .context("OpenAI embeddings request failed")?;

            let status = response.status();
            let body: Value = response
                .json()
                .await
                .context("OpenAI embeddings response was not JSON")?;
            if !status.is_success() {
                bail!("OpenAI embeddings error {status}: {body}");
            }
            embeddings.extend(parse_data_embeddings(&body)?);
        }
        Ok(embeddings)
    }
}

// ============ Azure ============

/// Azure OpenAI embeddings provider (`api-key` header, deployment URL).
pub struct AzureEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    dims: usize,
    batch_size: usize,
}

impl AzureEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.azure.api_key.is_empty() || config.azure.endpoint.is_empty() {
            bail!("embedding.azure.api_key and embedding.azure.endpoint are required");
        }
        Ok(Self {
            client: http_client()?,
            api_key: config.azure.api_key.clone(),
            endpoint: config.azure.endpoint.clone(),
            dims: config.dimension,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for AzureEmbeddingProvider {
    fn kind(&self) -> &str {
        "azure"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in partition_batches(texts, self.batch_size) {
            let response = self
                .client
                .post(&self.endpoint)
                .header("api-key", &self.api_key)
                .json(&json!({ "input": batch }))
                .send()
                .await
                .context("Azure embeddings request failed")?;

            let status = response.status();
            let body: Value = response
                .json()
                .await
                .context("Azure embeddings response was not JSON")?;
            if !status.is_success() {
                bail!("Azure embeddings error {status}: {body}");
            }
            embeddings.extend(parse_data_embeddings(&body)?);
        }
        Ok(embeddings)
    }
}

// ============ DashScope ============

/// DashScope text-embedding provider.
pub struct DashScopeEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl DashScopeEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.dashscope.api_key.is_empty() {
            bail!("embedding.dashscope.api_key is required");
        }
        let model = if config.dashscope.model.is_empty() {
            "text-embedding-v2".to_string()
        } else {
            config.dashscope.model.clone()
        };
        Ok(Self {
            client: http_client()?,
            api_key: config.dashscope.api_key.clone(),
            model,
            dims: config.dimension,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for DashScopeEmbeddingProvider {
    fn kind(&self) -> &str {
        "dashscope"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url =
            "https://dashscope.aliyuncs.com/api/v1/services/embeddings/text-embedding/text-embedding";
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in partition_batches(texts, self.batch_size) {
            let response = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&json!({ "model": self.model, "input": { "texts": batch } }))
                .send()
                .await
                .context("DashScope embeddings request failed")?;

            let status = response.status();
            let body: Value = response
                .json()
                .await
                .context("DashScope embeddings response was not JSON")?;
            if !status.is_success() {
                bail!("DashScope embeddings error {status}: {body}");
            }

            let data = body
                .pointer("/output/embeddings")
                .and_then(|d| d.as_array())
                .ok_or_else(|| anyhow::anyhow!("DashScope response missing output.embeddings"))?;
            for item in data {
                embeddings.push(parse_embedding_array(item.get("embedding"))?);
            }
        }
        Ok(embeddings)
    }
}

// ============ shared parsing ============

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(60))
        .build()
        .context("failed to build embedding HTTP client")
}

/// Extract `data[].embedding` arrays in input order (OpenAI/Azure shape).
fn parse_data_embeddings(body: &Value) -> Result<Vec<Vec<f32>>> {
    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("embedding response missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        embeddings.push(parse_embedding_array(item.get("embedding"))?);
    }
    Ok(embeddings)
}

fn parse_embedding_array(value: Option<&Value>) -> Result<Vec<f32>> {
    let array = value
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("embedding response missing embedding array"))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}
