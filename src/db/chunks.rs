//! Content chunk repository backed by `chunks` and the `chunks_vec` vector table

use chrono::{DateTime, NaiveDateTime, Utc};

use super::embedder::{Embedder, normalize};
use super::{DbPool, SCHEMA_VERSION, schema};
use crate::{Error, Result};

/// An ingested piece of source text
#[derive(Debug, Clone)]
pub struct ContentChunk {
    /// Monotonic id; larger means ingested later
    pub id: i64,
    pub text: String,
    /// File or document the text came from
    pub source: String,
    /// Unit-length embedding
    pub embedding: Vec<f32>,
    pub ingested_at: DateTime<Utc>,
}

/// A chunk waiting to be written
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub source: String,
    pub embedding: Vec<f32>,
}

/// A nearest-neighbour hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub id: i64,
    pub text: String,
    pub source: String,
    /// Cosine similarity clamped to `[0, 1]`
    pub score: f32,
}

/// Vector store repository
#[derive(Clone)]
pub struct VectorStore {
    pool: DbPool,
}

impl VectorStore {
    /// Create a store over an opened pool
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Fail with [`Error::Unprovisioned`] unless all migrations ran
    fn ensure_provisioned(conn: &rusqlite::Connection) -> Result<()> {
        if schema::version(conn) < SCHEMA_VERSION {
            return Err(Error::Unprovisioned);
        }
        Ok(())
    }

    /// Embedding dimension recorded at provisioning
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unprovisioned`] if the schema is missing
    pub fn dimension(&self) -> Result<usize> {
        let conn = self.conn()?;
        Self::ensure_provisioned(&conn)?;

        let value: String = conn.query_row(
            "SELECT value FROM store_meta WHERE key = 'embedding_dim'",
            [],
            |row| row.get(0),
        )?;
        value
            .parse()
            .map_err(|_| Error::Database(format!("invalid stored dimension: {value}")))
    }

    /// Embedding model recorded at provisioning
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unprovisioned`] if the schema is missing
    pub fn model(&self) -> Result<Option<String>> {
        let conn = self.conn()?;
        Self::ensure_provisioned(&conn)?;

        match conn.query_row(
            "SELECT value FROM store_meta WHERE key = 'embedding_model'",
            [],
            |row| row.get(0),
        ) {
            Ok(model) => Ok(Some(model)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of stored chunks
    ///
    /// # Errors
    ///
    /// Returns error if the store is unprovisioned or the query fails
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        Self::ensure_provisioned(&conn)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Insert chunks in one transaction, returning their ids in input order
    ///
    /// Embeddings are normalized before they are stored.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unprovisioned, a dimension does not match,
    /// or a write fails
    pub fn insert_batch(&self, chunks: &[NewChunk]) -> Result<Vec<i64>> {
        let dim = self.dimension()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.embedding.len() != dim {
                return Err(Error::Embedding(format!(
                    "embedding has dimension {}, store expects {dim}",
                    chunk.embedding.len()
                )));
            }

            let mut embedding = chunk.embedding.clone();
            normalize(&mut embedding);
            let bytes = Embedder::to_bytes(&embedding);

            tx.execute(
                "INSERT INTO chunks (text, source, embedding, ingested_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    chunk.text,
                    chunk.source,
                    bytes,
                    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
                ],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO chunks_vec (rowid, embedding) VALUES (?1, ?2)",
                rusqlite::params![id, bytes],
            )?;
            ids.push(id);
        }

        tx.commit()?;
        tracing::debug!(count = ids.len(), "chunks inserted");
        Ok(ids)
    }

    /// Remove every chunk ingested from `source`
    ///
    /// # Errors
    ///
    /// Returns error if the store is unprovisioned or a write fails
    pub fn delete_source(&self, source: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        Self::ensure_provisioned(&conn)?;
        let tx = conn.transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM chunks WHERE source = ?1")?;
            let rows = stmt.query_map(rusqlite::params![source], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for id in &ids {
            tx.execute("DELETE FROM chunks_vec WHERE rowid = ?1", rusqlite::params![id])?;
        }

        let deleted = tx.execute(
            "DELETE FROM chunks WHERE source = ?1",
            rusqlite::params![source],
        )?;

        tx.commit()?;
        Ok(deleted)
    }

    /// Get a chunk by id
    ///
    /// # Errors
    ///
    /// Returns error if the store is unprovisioned or the query fails
    pub fn get(&self, id: i64) -> Result<Option<ContentChunk>> {
        let conn = self.conn()?;
        Self::ensure_provisioned(&conn)?;

        let result = conn.query_row(
            "SELECT id, text, source, embedding, ingested_at FROM chunks WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                let bytes: Vec<u8> = row.get(3)?;
                let ingested_at: String = row.get(4)?;
                Ok(ContentChunk {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    source: row.get(2)?,
                    embedding: Embedder::from_bytes(&bytes),
                    ingested_at: parse_timestamp(&ingested_at),
                })
            },
        );

        match result {
            Ok(chunk) => Ok(Some(chunk)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the `k` chunks closest to `query`
    ///
    /// Results are ordered by score descending, ties broken by the most
    /// recently ingested chunk first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unprovisioned`] for a missing schema, an embedding error
    /// on dimension mismatch, or a database error
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let dim = self.dimension()?;
        if query.len() != dim {
            return Err(Error::Embedding(format!(
                "query has dimension {}, store expects {dim}",
                query.len()
            )));
        }

        let mut query = query.to_vec();
        normalize(&mut query);
        let bytes = Embedder::to_bytes(&query);

        // Over-fetch so equal-distance neighbours past `k` can win the tie-break
        let fetch_limit = k.saturating_mul(2);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"SELECT c.id, c.text, c.source, v.distance
              FROM (
                  SELECT rowid, distance
                  FROM chunks_vec
                  WHERE embedding MATCH ?1
                  ORDER BY distance
                  LIMIT ?2
              ) v
              INNER JOIN chunks c ON c.id = v.rowid",
        )?;

        #[allow(clippy::cast_possible_wrap)]
        let rows = stmt.query_map(rusqlite::params![bytes, fetch_limit as i64], |row| {
            let distance: f64 = row.get(3)?;
            Ok(ScoredChunk {
                id: row.get(0)?,
                text: row.get(1)?,
                source: row.get(2)?,
                score: similarity_from_distance(distance),
            })
        })?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.id.cmp(&a.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

/// Convert an L2 distance between unit vectors to cosine similarity in `[0, 1]`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn similarity_from_distance(distance: f64) -> f32 {
    let cosine = 1.0 - (distance * distance) / 2.0;
    (cosine as f32).clamp(0.0, 1.0)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, open_memory};

    fn chunk(text: &str, embedding: Vec<f32>) -> NewChunk {
        NewChunk {
            text: text.to_string(),
            source: "policies.md".to_string(),
            embedding,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = VectorStore::new(init_memory(3).unwrap());
        let ids = store
            .insert_batch(&[chunk("Refunds within 30 days.", vec![2.0, 0.0, 0.0])])
            .unwrap();

        let stored = store.get(ids[0]).unwrap().unwrap();
        assert_eq!(stored.text, "Refunds within 30 days.");
        assert!((stored.embedding[0] - 1.0).abs() < 1e-6);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_nearest_orders_by_score() {
        let store = VectorStore::new(init_memory(3).unwrap());
        store
            .insert_batch(&[
                chunk("shipping", vec![0.0, 1.0, 0.0]),
                chunk("refunds", vec![1.0, 0.1, 0.0]),
                chunk("warranty", vec![0.0, 0.0, 1.0]),
            ])
            .unwrap();

        let hits = store.nearest(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "refunds");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[test]
    fn test_ties_prefer_latest() {
        let store = VectorStore::new(init_memory(2).unwrap());
        let ids = store
            .insert_batch(&[
                chunk("old", vec![1.0, 0.0]),
                chunk("new", vec![1.0, 0.0]),
            ])
            .unwrap();

        let hits = store.nearest(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, ids[1]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let store = VectorStore::new(init_memory(3).unwrap());
        assert!(store.nearest(&[1.0, 0.0], 3).is_err());
        assert!(store.insert_batch(&[chunk("x", vec![1.0])]).is_err());
    }

    #[test]
    fn test_unprovisioned() {
        let store = VectorStore::new(open_memory().unwrap());
        assert!(matches!(store.nearest(&[1.0], 3), Err(Error::Unprovisioned)));
        assert!(matches!(store.count(), Err(Error::Unprovisioned)));
    }

    #[test]
    fn test_delete_source() {
        let store = VectorStore::new(init_memory(2).unwrap());
        store
            .insert_batch(&[chunk("a", vec![1.0, 0.0]), chunk("b", vec![0.0, 1.0])])
            .unwrap();

        assert_eq!(store.delete_source("policies.md").unwrap(), 2);
        assert!(store.nearest(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn test_similarity_from_distance() {
        assert!((similarity_from_distance(0.0) - 1.0).abs() < 1e-6);
        assert!(similarity_from_distance(2.0).abs() < 1e-6);
        assert!((similarity_from_distance(std::f64::consts::SQRT_2) - 0.0).abs() < 1e-6);
    }
}
