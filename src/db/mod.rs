//! Database module for the knowledge vector store

pub mod chunks;
pub mod embedder;
mod schema;

use std::path::Path;
use std::sync::Once;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::{Error, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register sqlite-vec extension for all new connections
///
/// This must be called before creating any database connections.
/// Safe to call multiple times; only the first call has any effect.
#[allow(unsafe_code)]
pub(crate) fn register_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: `sqlite3_vec_init` is the entry point exported by the sqlite-vec
        // crate for `sqlite3_auto_extension`. The transmute only restates its
        // signature as the one `SQLite` expects.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut rusqlite::ffi::sqlite3,
                    *mut *mut i8,
                    *const rusqlite::ffi::sqlite3_api_routines,
                ) -> i32,
            >(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

pub use chunks::{ContentChunk, NewChunk, ScoredChunk, VectorStore};
pub use embedder::{DEFAULT_EMBEDDING_MODEL, EMBEDDING_DIM, Embedder, TextEmbedder};
pub use schema::SCHEMA_VERSION;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

fn build_pool(manager: SqliteConnectionManager, max_size: u32) -> Result<DbPool> {
    let manager = manager.with_init(|c| c.execute_batch("PRAGMA busy_timeout = 5000;"));
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))
}

/// Provision the database, running any pending migrations
///
/// # Errors
///
/// Returns error if database cannot be opened or migrated
pub fn init<P: AsRef<Path>>(path: P, model: &str, dim: usize) -> Result<DbPool> {
    // Register sqlite-vec before creating any connections
    register_sqlite_vec();

    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = build_pool(SqliteConnectionManager::file(path.as_ref()), 4)?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    schema::init(&conn, model, dim)?;

    tracing::info!(
        version = SCHEMA_VERSION,
        path = %path.as_ref().display(),
        dim,
        "database provisioned"
    );
    Ok(pool)
}

/// Open an existing database without migrating
///
/// A database whose schema is behind is still returned; callers check
/// [`is_provisioned`] or get [`Error::Unprovisioned`] from the store.
///
/// # Errors
///
/// Returns [`Error::Unprovisioned`] if the file does not exist, or an error if
/// it cannot be opened
pub fn open<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    register_sqlite_vec();

    if !path.as_ref().exists() {
        return Err(Error::Unprovisioned);
    }

    let pool = build_pool(SqliteConnectionManager::file(path.as_ref()), 4)?;
    tracing::debug!(path = %path.as_ref().display(), "database opened");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory(dim: usize) -> Result<DbPool> {
    register_sqlite_vec();

    let pool = build_pool(SqliteConnectionManager::memory(), 1)?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn, DEFAULT_EMBEDDING_MODEL, dim)?;

    Ok(pool)
}

/// Open an in-memory database that has not been provisioned (for testing)
///
/// # Errors
///
/// Returns error if the pool cannot be built
pub fn open_memory() -> Result<DbPool> {
    register_sqlite_vec();
    build_pool(SqliteConnectionManager::memory(), 1)
}

/// Current schema version of the database
///
/// # Errors
///
/// Returns error if no connection can be acquired
pub fn schema_version(pool: &DbPool) -> Result<i32> {
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    Ok(schema::version(&conn))
}

/// Whether all migrations have been applied
#[must_use]
pub fn is_provisioned(pool: &DbPool) -> bool {
    schema_version(pool).is_ok_and(|v| v >= SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory() {
        let pool = init_memory(4).unwrap();
        assert!(is_provisioned(&pool));
    }

    #[test]
    fn test_open_memory_is_unprovisioned() {
        let pool = open_memory().unwrap();
        assert!(!is_provisioned(&pool));
        assert_eq!(schema_version(&pool).unwrap(), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = open(dir.path().join("missing.db"));
        assert!(matches!(result, Err(Error::Unprovisioned)));
    }

    #[test]
    fn test_init_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lectern.db");

        init(&path, DEFAULT_EMBEDDING_MODEL, 8).unwrap();
        let pool = open(&path).unwrap();
        assert!(is_provisioned(&pool));
    }
}
