//! Database schema and migrations

use rusqlite::Connection;

use crate::{Error, Result};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Read `PRAGMA user_version`, treating failures as an empty database
pub fn version(conn: &Connection) -> i32 {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0)
}

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails or the stored embedding dimension
/// conflicts with `dim`
pub fn init(conn: &Connection, model: &str, dim: usize) -> Result<()> {
    if dim == 0 {
        return Err(Error::Config("embedding dimension must be non-zero".to_string()));
    }

    let version = version(conn);

    if version < 1 {
        migrate_v1(conn, model, dim)?;
    } else {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'embedding_dim'",
                [],
                |row| row.get(0),
            )
            .ok();
        if let Some(stored) = stored
            && stored != dim.to_string()
        {
            return Err(Error::Config(format!(
                "store was provisioned with dimension {stored}, configured {dim}"
            )));
        }
    }

    Ok(())
}

fn migrate_v1(conn: &Connection, model: &str, dim: usize) -> Result<()> {
    conn.execute_batch(&format!(
        r"
        -- Provisioning metadata
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Ingested content chunks
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text TEXT NOT NULL,
            source TEXT NOT NULL,
            embedding BLOB NOT NULL,
            ingested_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);

        -- Vector table keyed by chunk id
        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(
            embedding FLOAT[{dim}]
        );
        "
    ))?;

    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('embedding_model', ?1), ('embedding_dim', ?2)",
        rusqlite::params![model, dim.to_string()],
    )?;

    conn.execute_batch("PRAGMA user_version = 1;")?;

    tracing::info!(dim, model, "migrated to schema v1 (chunks, chunks_vec)");
    Ok(())
}
