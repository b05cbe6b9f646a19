//! Knowledge store provisioning (`lectern setup`)

use std::fmt;
use std::path::{Path, PathBuf};

use crate::db::{self, DbPool, VectorStore};
use crate::{Config, Error, Result};

/// State of a provisioned store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReport {
    pub path: PathBuf,
    pub schema_version: i32,
    pub model: Option<String>,
    pub dimension: usize,
    pub chunks: usize,
}

impl fmt::Display for SetupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Database:  {}", self.path.display())?;
        writeln!(f, "Schema:    v{}", self.schema_version)?;
        writeln!(
            f,
            "Embedding: {} ({} dimensions)",
            self.model.as_deref().unwrap_or("unknown"),
            self.dimension
        )?;
        write!(f, "Chunks:    {}", self.chunks)
    }
}

/// Create or migrate the knowledge store
///
/// Safe to run repeatedly.
///
/// # Errors
///
/// Returns error if the database cannot be created, or if it was provisioned
/// with a different embedding dimension
pub fn provision(config: &Config) -> Result<SetupReport> {
    let path = config.db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = db::init(
        &path,
        &config.retrieval.embedding_model,
        config.retrieval.embedding_dim,
    )?;
    tracing::info!(path = %path.display(), "knowledge store provisioned");

    report(&path, &pool)
}

/// Verify the store is provisioned without changing it
///
/// # Errors
///
/// Returns [`Error::Unprovisioned`] if the database is missing or behind
pub fn check(config: &Config) -> Result<SetupReport> {
    let path = config.db_path();
    let pool = db::open(&path)?;
    if !db::is_provisioned(&pool) {
        return Err(Error::Unprovisioned);
    }
    report(&path, &pool)
}

fn report(path: &Path, pool: &DbPool) -> Result<SetupReport> {
    let store = VectorStore::new(pool.clone());
    Ok(SetupReport {
        path: path.to_path_buf(),
        schema_version: db::schema_version(pool)?,
        model: store.model()?,
        dimension: store.dimension()?,
        chunks: store.count()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_check_before_provision_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        assert!(matches!(check(&config), Err(Error::Unprovisioned)));
    }

    #[test]
    fn test_provision_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let provisioned = provision(&config).unwrap();
        assert_eq!(provisioned.schema_version, db::SCHEMA_VERSION);
        assert_eq!(provisioned.dimension, config.retrieval.embedding_dim);
        assert_eq!(provisioned.chunks, 0);

        // Idempotent
        provision(&config).unwrap();

        let checked = check(&config).unwrap();
        assert_eq!(checked, provisioned);
        assert!(checked.to_string().contains("Chunks:    0"));
    }
}
