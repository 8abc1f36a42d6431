//! SQL DDL for the memory index.
//!
//! Defines the `memories`, `memory_keys`, `memory_keys_vec` (vec0), `sources`, `memory_log`
//! and `schema_meta` tables. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension};

pub const SCHEMA_VERSION: &str = "1";

const SCHEMA_SQL: &str = r#"
-- One row per fragment
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'root',
    content TEXT NOT NULL,
    watch_source INTEGER NOT NULL DEFAULT 0,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    memory TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_source ON memories(source);
CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(scope);

-- Embedded lookup keys (title and relevant questions) of each fragment
CREATE TABLE IF NOT EXISTS memory_keys (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    key TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_keys_memory ON memory_keys(memory_id);

-- Last ingested content hash per source
CREATE TABLE IF NOT EXISTS sources (
    source TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','delete')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all tables with a vector index of `dimensions`. Idempotent; fails if the
/// database was created with a different dimension.
pub fn init_schema(conn: &Connection, dimensions: usize) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    match get_meta(conn, "embedding_dimensions")? {
        Some(existing) if existing != dimensions.to_string() => bail!(
            "memory database was created with {existing}-dimensional embeddings, \
             configured provider produces {dimensions}"
        ),
        Some(_) => {}
        None => set_meta(conn, "embedding_dimensions", &dimensions.to_string())?,
    }

    // vec0 dimensions are fixed at creation, so the DDL is built per database.
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_keys_vec USING vec0(
            id TEXT PRIMARY KEY,
            embedding FLOAT[{dimensions}]
        );"
    ))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        crate::db::load_sqlite_vec();
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn schema_creates_all_tables() {
        let conn = fresh();
        init_schema(&conn, 8).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["memories", "memory_keys", "sources", "memory_log", "schema_meta"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = fresh();
        init_schema(&conn, 8).unwrap();
        init_schema(&conn, 8).unwrap();
        assert_eq!(
            get_meta(&conn, "schema_version").unwrap().as_deref(),
            Some(SCHEMA_VERSION)
        );
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let conn = fresh();
        init_schema(&conn, 8).unwrap();
        let err = init_schema(&conn, 16).unwrap_err();
        assert!(err.to_string().contains("8-dimensional"));
    }
}
