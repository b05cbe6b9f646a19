//! Text embedding for knowledge search

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// Embedding dimension for text-embedding-3-small
pub const EMBEDDING_DIM: usize = 1536;

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Anything that can turn text into vectors
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed several texts, preserving input order
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".to_string()))
    }
}

/// Text embedder for any `OpenAI`-compatible `/embeddings` endpoint
#[derive(Debug)]
pub struct Embedder {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
}

impl Embedder {
    /// Create a new embedder
    ///
    /// A key is only optional for self-hosted endpoints.
    ///
    /// # Errors
    ///
    /// Returns error if the hosted `OpenAI` endpoint is used without an API key
    pub fn new(api_key: Option<&SecretString>, base_url: &str, model: &str) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.expose_secret().is_empty())
            .map(|k| SecretString::from(k.expose_secret().to_string()));

        if api_key.is_none() && base_url.contains("api.openai.com") {
            return Err(Error::Config(
                "OpenAI API key required for embeddings".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    /// Model identifier
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Serialize embedding to bytes for `SQLite` storage
    #[must_use]
    pub fn to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize embedding from bytes
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
                f32::from_le_bytes(arr)
            })
            .collect()
    }
}

/// Scale a vector to unit length in place; zero vectors are left unchanged
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[async_trait]
impl TextEmbedder for Embedder {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        #[derive(serde::Serialize)]
        struct EmbeddingRequest<'a> {
            model: &'a str,
            input: &'a [&'a str],
        }

        #[derive(serde::Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }

        #[derive(serde::Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
            index: usize,
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("API error {status}: {body}")));
        }

        let mut result: EmbeddingResponse = response.json().await?;

        // Sort by index to maintain input order
        result.data.sort_by_key(|d| d.index);

        if result.data.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let embedding = vec![1.0, 2.5, -3.25, 0.0, 100.0];
        let restored = Embedder::from_bytes(&Embedder::to_bytes(&embedding));
        assert_eq!(embedding, restored);
    }

    #[test]
    fn test_hosted_endpoint_requires_key() {
        let result = Embedder::new(None, "https://api.openai.com/v1", DEFAULT_EMBEDDING_MODEL);
        assert!(result.is_err());

        let local = Embedder::new(None, "http://localhost:11434/v1/", "nomic-embed-text").unwrap();
        assert_eq!(local.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
