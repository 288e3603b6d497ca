//! Embedding providers.
//!
//! [`Embedder::Rest`] calls an external embedding service over HTTP.
//! [`Embedder::Deterministic`] derives vectors from token hashes — no network,
//! stable across runs — for keyless dev environments and tests.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{MagpieError, Result};

/// Largest number of texts sent in one HTTP request; bigger batches are split.
const REST_SUB_BATCH: usize = 100;

pub enum Embedder {
    Rest(RestEmbedder),
    Deterministic(DeterministicEmbedder),
}

impl Embedder {
    pub fn rest(url: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Embedder::Rest(RestEmbedder::new(url, model, dimensions))
    }

    pub fn deterministic(dimensions: usize) -> Self {
        Embedder::Deterministic(DeterministicEmbedder::new(dimensions))
    }

    pub fn dimensions(&self) -> usize {
        match self {
            Embedder::Rest(e) => e.dimensions,
            Embedder::Deterministic(e) => e.dimensions,
        }
    }

    pub async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        match self {
            Embedder::Rest(e) => e.embed_documents(texts).await,
            Embedder::Deterministic(e) => Ok(texts.iter().map(|t| e.embed(t)).collect()),
        }
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed_documents(&[text]).await?;
        vecs.pop()
            .ok_or_else(|| MagpieError::Embedding("empty response from embedder".into()))
    }
}

/// HTTP embedder with a fixed request shape:
/// `{"model": ..., "input": [...]}` → `{"embeddings": [[...], ...]}`.
pub struct RestEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl RestEmbedder {
    pub fn new(url: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        RestEmbedder {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
            dimensions,
        }
    }

    pub async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(REST_SUB_BATCH) {
            all.extend(self.request_chunk(chunk).await?);
        }
        Ok(all)
    }

    async fn request_chunk(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MagpieError::Embedding(format!("HTTP request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MagpieError::Embedding(format!(
                "embedding service returned {status}: {text}"
            )));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| MagpieError::Embedding(format!("invalid response body: {e}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(MagpieError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        for vec in &parsed.embeddings {
            if vec.len() != self.dimensions {
                return Err(MagpieError::DimensionMismatch {
                    expected: self.dimensions,
                    got: vec.len(),
                });
            }
        }
        Ok(parsed.embeddings)
    }
}

/// Token-hash embedder. Each lowercased token is hashed into a bucket; the
/// resulting vector is L2-normalized. Texts sharing tokens land near each
/// other under cosine distance, which is enough for dev and tests.
pub struct DeterministicEmbedder {
    dimensions: usize,
}

impl DeterministicEmbedder {
    pub fn new(dimensions: usize) -> Self {
        DeterministicEmbedder { dimensions }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let hash = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(hash[..8].try_into().expect("8-byte slice"))
                as usize
                % self.dimensions;
            // Second hash byte decides sign so buckets don't only accumulate.
            let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}
