//! Embedding clients.
//!
//! [`EmbeddingClient`] is the capability set the indexer and search engine
//! consume: embed one text, embed a batch in order, report dimensions. The
//! HTTP implementation talks to any OpenAI-compatible `/embeddings`
//! endpoint; the hash implementation is a deterministic, dependency-free
//! fallback used by tests and degraded runs.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

/// Provider-agnostic text embedding capability.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a single text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch, preserving input order. Callers batch in groups of
    /// at most [`crate::indexer::EMBED_BATCH`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// HTTP implementation (OpenAI-compatible /embeddings)
// ---------------------------------------------------------------------------

/// Embedding client for an OpenAI-compatible HTTP endpoint.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    /// Build a client. `base_url` is the API root (the `/embeddings` path
    /// is appended).
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<String>, model: &str, dim: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            dim,
        }
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        // Transport failures are retryable; the indexer owns the backoff.
        let resp = req
            .send()
            .await
            .map_err(|e| Error::EmbeddingTransient(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::EmbeddingTransient(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            // 4xx (including 429 quota exhaustion) is not worth retrying.
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::EmbeddingFatal(format!("{url}: HTTP {status}: {detail}")));
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| Error::EmbeddingFatal(format!("malformed embeddings response: {e}")))?;

        if parsed.data.len() != inputs.len() {
            return Err(Error::EmbeddingFatal(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }

        // Restore input order from the per-item index.
        let mut vectors: Vec<Vec<f32>> = vec![Vec::new(); inputs.len()];
        for item in parsed.data {
            if item.index >= vectors.len() {
                return Err(Error::EmbeddingFatal(format!(
                    "embedding index {} out of range",
                    item.index
                )));
            }
            if item.embedding.len() != self.dim {
                return Err(Error::EmbeddingFatal(format!(
                    "embedding dimension {} does not match configured {}",
                    item.embedding.len(),
                    self.dim
                )));
            }
            vectors[item.index] = item.embedding;
        }

        debug!(count = inputs.len(), "Embedded batch");
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingFatal("empty embeddings response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Deterministic hash embedder (tests, degraded mode)
// ---------------------------------------------------------------------------

/// Deterministic embedding from token hashes. Not semantically meaningful,
/// but stable across runs and L2-normalized, which is all the pipeline
/// invariants require.
pub struct HashEmbeddingClient {
    dim: usize,
}

impl HashEmbeddingClient {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dim;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let client = HashEmbeddingClient::new(64);
        let a = client.embed("validate the JWT token").await.unwrap();
        let b = client.embed("validate the JWT token").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_embedder_batch_preserves_order() {
        let client = HashEmbeddingClient::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let batch = client.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vec) in texts.iter().zip(&batch) {
            assert_eq!(vec, &client.embed(text).await.unwrap());
        }
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let client = HashEmbeddingClient::new(128);
        let query = client.embed("jwt token validation").await.unwrap();
        let hit = client.embed("jwt token validation in auth middleware").await.unwrap();
        let miss = client.embed("draw rectangle on canvas").await.unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&query, &hit) > dot(&query, &miss));
    }
}
