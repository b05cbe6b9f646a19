//! Query-time retrieval over the vector store

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::Error;
use crate::db::{ScoredChunk, TextEmbedder, VectorStore};

/// A chunk returned for a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub id: i64,
    pub text: String,
    pub source: String,
    /// Similarity in `[0, 1]`
    pub score: f32,
}

impl From<ScoredChunk> for RetrievedChunk {
    fn from(hit: ScoredChunk) -> Self {
        Self {
            id: hit.id,
            text: hit.text,
            source: hit.source,
            score: hit.score,
        }
    }
}

/// Finds context for a query
///
/// Retrieval never fails: any problem degrades to an empty result.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `k` chunks ordered by score descending
    async fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedChunk>;
}

/// Retriever used when no knowledge base is available
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRetriever;

#[async_trait]
impl Retriever for EmptyRetriever {
    async fn retrieve(&self, _query: &str, _k: usize) -> Vec<RetrievedChunk> {
        Vec::new()
    }
}

/// Embedding-based retriever backed by a [`VectorStore`]
pub struct KnowledgeRetriever {
    store: VectorStore,
    embedder: Arc<dyn TextEmbedder>,
}

impl KnowledgeRetriever {
    #[must_use]
    pub fn new(store: VectorStore, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl Retriever for KnowledgeRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedChunk> {
        if query.trim().is_empty() || k == 0 {
            return Vec::new();
        }

        let start = Instant::now();

        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, continuing without context");
                return Vec::new();
            }
        };

        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.nearest(&embedding, k)).await;

        let hits = match result {
            Ok(Ok(hits)) => hits,
            Ok(Err(Error::Unprovisioned)) => {
                tracing::warn!("vector store is not provisioned, continuing without context");
                return Vec::new();
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "vector search failed, continuing without context");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "vector search task failed");
                return Vec::new();
            }
        };

        tracing::debug!(
            hits = hits.len(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "retrieval complete"
        );

        hits.into_iter().map(RetrievedChunk::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewChunk, init_memory, open_memory};

    /// Embeds by keyword so tests control geometry
    struct KeywordEmbedder;

    #[async_trait]
    impl TextEmbedder for KeywordEmbedder {
        async fn embed_batch(&self, texts: &[&str]) -> crate::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("refund") { 1.0 } else { 0.0 },
                        if t.contains("ship") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl TextEmbedder for FailingEmbedder {
        async fn embed_batch(&self, _texts: &[&str]) -> crate::Result<Vec<Vec<f32>>> {
            Err(Error::Embedding("offline".to_string()))
        }
    }

    fn seeded_store() -> VectorStore {
        let store = VectorStore::new(init_memory(3).unwrap());
        store
            .insert_batch(&[
                NewChunk {
                    text: "Refunds are issued within 30 days of purchase.".to_string(),
                    source: "refunds.md".to_string(),
                    embedding: vec![1.0, 0.0, 0.1],
                },
                NewChunk {
                    text: "Orders ship in two business days.".to_string(),
                    source: "shipping.md".to_string(),
                    embedding: vec![0.0, 1.0, 0.1],
                },
            ])
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_retrieve_ranked() {
        let retriever = KnowledgeRetriever::new(seeded_store(), Arc::new(KeywordEmbedder));
        let hits = retriever.retrieve("what is the refund policy", 3).await;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, "refunds.md");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_empty() {
        let retriever = KnowledgeRetriever::new(seeded_store(), Arc::new(FailingEmbedder));
        assert!(retriever.retrieve("refund", 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_unprovisioned_is_empty() {
        let store = VectorStore::new(open_memory().unwrap());
        let retriever = KnowledgeRetriever::new(store, Arc::new(KeywordEmbedder));
        assert!(retriever.retrieve("refund", 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_is_empty() {
        let store = VectorStore::new(init_memory(3).unwrap());
        let retriever = KnowledgeRetriever::new(store, Arc::new(KeywordEmbedder));
        assert!(retriever.retrieve("refund", 3).await.is_empty());
    }
}
