//! Embedding capability abstraction.
//!
//! An [`Embedder`] turns a batch of texts into fixed-length vectors. The
//! engine never talks to one directly; it goes through an
//! [`EmbeddingAdapter`], which checks that the capability returned exactly
//! one vector per input with the advertised dimensionality and tags every
//! vector with the model identifier that produced it.
//!
//! | `embedding.provider` | Implementation |
//! |----------------------|----------------|
//! | `"hash"` | [`HashEmbedder`], offline feature hashing |
//! | `"ollama"` | [`OllamaEmbedder`], `POST {url}/api/embed` |
//! | `"openai"` | [`OpenAIEmbedder`], `POST /v1/embeddings` |
//! | `"local"` | `LocalEmbedder`, fastembed (feature `local-embeddings-fastembed`) |
//! | `"disabled"` | [`DisabledEmbedder`] |
//!
//! Providers make a single attempt per call and classify failures: HTTP 429,
//! 5xx and network errors are transient ([`EmbeddingError::Unavailable`]),
//! other 4xx are permanent ([`EmbeddingError::Rejected`]). Retry and batch
//! shrinking live in the ingestion pipeline.
//!
//! Also provides the vector helpers [`vec_to_blob`], [`blob_to_vec`] and
//! [`cosine_similarity`].

mod hashing;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

pub use hashing::HashEmbedder;

const DEFAULT_HASH_DIMS: usize = 256;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored next to every vector this embedder produces.
    fn model_id(&self) -> &str;
    fn dims(&self) -> usize;
    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// A vector together with the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedVector {
    pub model: String,
    pub values: Vec<f32>,
}

impl TaggedVector {
    pub fn dims(&self) -> usize {
        self.values.len()
    }
}

/// Validating front of an [`Embedder`].
#[derive(Clone)]
pub struct EmbeddingAdapter {
    inner: Arc<dyn Embedder>,
}

impl EmbeddingAdapter {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self { inner }
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    pub fn dims(&self) -> usize {
        self.inner.dims()
    }

    /// Embed `texts`, preserving order and count.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<TaggedVector>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.inner.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        let model = self.inner.model_id().to_string();
        let dims = self.inner.dims();
        vectors
            .into_iter()
            .map(|values| {
                if values.len() != dims {
                    Err(EmbeddingError::DimensionMismatch {
                        model: model.clone(),
                        expected: dims,
                        actual: values.len(),
                    })
                } else {
                    Ok(TaggedVector {
                        model: model.clone(),
                        values,
                    })
                }
            })
            .collect()
    }

    pub async fn embed_query(&self, text: &str) -> Result<TaggedVector, EmbeddingError> {
        let mut out = self.embed(&[text.to_string()]).await?;
        out.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }
}

/// Delay before retry `attempt` (1-based): `base`, `2·base`, `4·base`, ...
/// capped at `32·base`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.saturating_sub(1).min(5))
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_id(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ HTTP providers ============

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

async fn post_json(
    request: reqwest::RequestBuilder,
    provider: &str,
) -> Result<serde_json::Value, EmbeddingError> {
    let response = request
        .send()
        .await
        .map_err(|e| EmbeddingError::Unavailable(format!("{} connection error: {}", provider, e)))?;
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("{} response: {}", provider, e)));
    }
    let body = response.text().await.unwrap_or_default();
    let msg = format!("{} API error {}: {}", provider, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EmbeddingError::Unavailable(msg))
    } else if status.as_u16() == 413 {
        Err(EmbeddingError::ResourceExhausted(msg))
    } else {
        Err(EmbeddingError::Rejected(msg))
    }
}

fn float_array(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Embeddings from a local Ollama server.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: http_client(config)?,
            model,
            dims,
            url,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body);
        let json = post_json(request, "Ollama").await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::Unavailable("Ollama response missing embeddings".into()))?
        .iter()
        .map(|e| {
            float_array(e).ok_or_else(|| {
                EmbeddingError::Unavailable("Ollama embedding is not an array".into())
            })
        })
        .collect()
}

/// Embeddings from the OpenAI API. Needs `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    api_key: String,
    url: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) => k,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            client: http_client(config)?,
            model,
            dims,
            api_key,
            url,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json(request, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

/// `data[]` may arrive out of order; each item carries its input index.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Unavailable("OpenAI response missing data".into()))?;
    let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        let vector = item
            .get("embedding")
            .and_then(float_array)
            .ok_or_else(|| EmbeddingError::Unavailable("OpenAI item missing embedding".into()))?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
    kind: fastembed::EmbeddingModel,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (kind, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            "multilingual-e5-small" => (fastembed::EmbeddingModel::MultilingualE5Small, 384),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5, multilingual-e5-small",
                other
            ),
        };
        Ok(Self {
            dims: config.dims.unwrap_or(default_dims),
            model_name,
            model: Arc::new(std::sync::Mutex::new(None)),
            kind,
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let slot = Arc::clone(&self.model);
        let kind = self.kind.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| EmbeddingError::Unavailable("local model lock poisoned".into()))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(kind))
                    .map_err(|e| EmbeddingError::Unavailable(format!("model init: {}", e)))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| EmbeddingError::Unavailable("local model missing".into()))?;
            let n = texts.len();
            model
                .embed(texts, Some(n))
                .map_err(|e| EmbeddingError::ResourceExhausted(format!("local embedding: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingError::Unavailable(format!("embedding task: {}", e)))?
    }
}

/// Build the configured embedder.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    Ok(match config.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(config.dims.unwrap_or(DEFAULT_HASH_DIMS))),
        "disabled" => Arc::new(DisabledEmbedder),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    })
}

/// Encode a vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverse of [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
