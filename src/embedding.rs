//! Embedding providers and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait and two implementations:
//!
//! - **`openai`** — calls the embeddings API with request batching; errors
//!   are classified for the retry combinator.
//! - **`hash`** — deterministic unit-norm pseudo-embedding derived from a
//!   SHA-256 chain over the text. No network, reproducible across runs;
//!   used for air-gapped runs and tests.
//!
//! Vectors are stored as little-endian `f32` BLOBs:
//! [`vec_to_blob`] / [`blob_to_vec`] convert, [`cosine_similarity`]
//! compares. Whatever provider is configured, a stored vector's length
//! must equal the configured dimensionality. Callers enforce this before
//! writing; a wrong-length vector is never persisted.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::retry::{classify_http_status, ProviderError};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded as embedding provenance.
    fn model_name(&self) -> &str;
    /// Vector dimensionality this provider produces.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Create a named [`EmbeddingProvider`] from configuration. Called once at
/// startup (and once more for the fallback, when configured).
pub fn create_provider(
    config: &EmbeddingConfig,
    provider: &str,
) -> Result<Box<dyn EmbeddingProvider>> {
    match provider {
        "hash" => Ok(Box::new(HashProvider { dims: config.dims })),
        "openai" => Ok(Box::new(OpenAiEmbeddingProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Hash provider ============

/// Deterministic pseudo-embedding provider.
///
/// Expands a SHA-256 chain seeded by the text into `dims` bytes, maps each
/// byte to `[-1, 1]`, and L2-normalizes. Identical text always produces an
/// identical unit vector, so cosine of a text with itself is 1.0.
pub struct HashProvider {
    dims: usize,
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}

impl HashProvider {
    fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::Permanent("empty text to embed".to_string()));
        }

        let mut bytes = Vec::with_capacity(self.dims);
        let mut block: Vec<u8> = Sha256::digest(text.as_bytes()).to_vec();
        while bytes.len() < self.dims {
            bytes.extend_from_slice(&block);
            block = Sha256::digest(&block).to_vec();
        }
        bytes.truncate(self.dims);

        let mut vec: Vec<f32> = bytes
            .iter()
            .map(|b| (*b as f32 - 127.5) / 127.5)
            .collect();

        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }

        Ok(vec)
    }
}

// ============ OpenAI provider ============

/// Embedding via the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment and `embedding.model` in
/// config. Batches the whole input slice into one request.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), detail));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let vectors = parse_embedding_response(&json)?;

        if vectors.len() != texts.len() {
            return Err(ProviderError::Permanent(format!(
                "embedding response count mismatch: sent {}, received {}",
                texts.len(),
                vectors.len()
            )));
        }

        Ok(vectors)
    }
}

/// Extract `data[].embedding` arrays in input order.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            ProviderError::Permanent("invalid embedding response: missing data array".to_string())
        })?;

    let mut items: Vec<(i64, Vec<f32>)> = Vec::with_capacity(data.len());

    for item in data {
        let index = item.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                ProviderError::Permanent(
                    "invalid embedding response: missing embedding".to_string(),
                )
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        items.push((index, vec));
    }

    // Sort by index to ensure order matches input
    items.sort_by_key(|(index, _)| *index);
    Ok(items.into_iter().map(|(_, vec)| vec).collect())
}

// ============ Vector encoding and similarity ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Reverses [`vec_to_blob`]: reads 4-byte little-endian `f32` values
/// from the byte slice.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// vectors of different lengths.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[tokio::test]
    async fn hash_provider_is_deterministic_and_unit_norm() {
        let provider = HashProvider { dims: 384 };
        let texts = vec!["Acme Capital is a registered investment adviser.".to_string()];

        let first = provider.embed(&texts).await.unwrap();
        let second = provider.embed(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 384);

        let norm: f32 = first[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        // Self-similarity is exactly the top of the scale.
        let sim = cosine_similarity(&first[0], &second[0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn hash_provider_distinguishes_texts() {
        let provider = HashProvider { dims: 64 };
        let vecs = provider
            .embed(&[
                "Acme Capital, St. Louis hedge fund adviser".to_string(),
                "Beacon Wealth, Chicago pension consultant".to_string(),
            ])
            .await
            .unwrap();
        let sim = cosine_similarity(&vecs[0], &vecs[1]);
        assert!(sim < 0.9);
    }

    #[tokio::test]
    async fn hash_provider_rejects_empty_text() {
        let provider = HashProvider { dims: 64 };
        let result = provider.embed(&["   ".to_string()]).await;
        assert!(matches!(result, Err(ProviderError::Permanent(_))));
    }

    #[test]
    fn embedding_response_sorts_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_embedding_response(&json).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }
}
