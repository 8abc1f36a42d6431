//! Write path: fragment rows, embedded index keys, source hashes and audit logging.
//!
//! Every function here is synchronous and takes the connection directly; the async
//! [`MemoryStore`](super::MemoryStore) computes embeddings first and then calls in with the
//! database lock held only for the duration of the call.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::db::embedding_to_bytes;
use crate::memory::types::{Memory, MemoryMeta, MemoryWithMeta};

/// Insert a fragment together with its embedded index keys.
///
/// `keys` pairs each key text with its normalized embedding.
pub fn insert_memory(
    conn: &mut Connection,
    fragment: &MemoryWithMeta,
    keys: &[(String, Vec<f32>)],
) -> Result<()> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO memories (id, source, scope, content, watch_source, start_line, end_line, memory, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            fragment.id,
            fragment.meta.source,
            fragment.meta.scope,
            fragment.meta.content,
            fragment.meta.watch_source,
            fragment.memory.start_line as i64,
            fragment.memory.end_line as i64,
            serde_json::to_string(&fragment.memory)?,
            fragment.meta.timestamp.to_rfc3339(),
        ],
    )?;

    for (key, embedding) in keys {
        insert_key(&tx, &fragment.id, key, embedding)?;
    }

    write_audit_log(
        &tx,
        "create",
        &fragment.id,
        Some(&serde_json::json!({
            "source": fragment.meta.source,
            "title": fragment.memory.title,
            "keys": keys.len(),
            "at": now,
        })),
    )?;
    tx.commit()?;
    Ok(())
}

fn insert_key(tx: &Transaction, memory_id: &str, key: &str, embedding: &[f32]) -> Result<()> {
    let key_id = uuid::Uuid::now_v7().to_string();
    tx.execute(
        "INSERT INTO memory_keys (id, memory_id, key) VALUES (?1, ?2, ?3)",
        params![key_id, memory_id, key],
    )?;
    tx.execute(
        "INSERT INTO memory_keys_vec (id, embedding) VALUES (?1, ?2)",
        params![key_id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

/// Move a fragment to a new line range after its source shifted.
pub fn update_line_range(
    conn: &Connection,
    memory_id: &str,
    start_line: usize,
    end_line: usize,
) -> Result<()> {
    let Some(mut fragment) = get_memory(conn, memory_id)? else {
        anyhow::bail!("memory not found: {memory_id}");
    };
    let previous = (fragment.memory.start_line, fragment.memory.end_line);
    fragment.memory.start_line = start_line;
    fragment.memory.end_line = end_line;

    conn.execute(
        "UPDATE memories SET start_line = ?1, end_line = ?2, memory = ?3, updated_at = ?4 WHERE id = ?5",
        params![
            start_line as i64,
            end_line as i64,
            serde_json::to_string(&fragment.memory)?,
            chrono::Utc::now().to_rfc3339(),
            memory_id,
        ],
    )?;
    write_audit_log(
        conn,
        "update",
        memory_id,
        Some(&serde_json::json!({
            "from": [previous.0, previous.1],
            "to": [start_line, end_line],
        })),
    )?;
    Ok(())
}

/// Remove a fragment, its keys and their vectors. Returns `false` if it did not exist.
pub fn delete_memory(conn: &mut Connection, memory_id: &str, reason: &str) -> Result<bool> {
    let tx = conn.transaction()?;

    let key_ids: Vec<String> = tx
        .prepare("SELECT id FROM memory_keys WHERE memory_id = ?1")?
        .query_map(params![memory_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    // vec0 tables do not take part in foreign key cascades.
    for key_id in &key_ids {
        tx.execute(
            "DELETE FROM memory_keys_vec WHERE id = ?1",
            params![key_id],
        )?;
    }
    tx.execute(
        "DELETE FROM memory_keys WHERE memory_id = ?1",
        params![memory_id],
    )?;
    let rows = tx.execute("DELETE FROM memories WHERE id = ?1", params![memory_id])?;

    if rows > 0 {
        write_audit_log(
            &tx,
            "delete",
            memory_id,
            Some(&serde_json::json!({"reason": reason})),
        )?;
    }
    tx.commit()?;
    Ok(rows > 0)
}

pub fn get_memory(conn: &Connection, memory_id: &str) -> Result<Option<MemoryWithMeta>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM memories WHERE id = ?1"),
        params![memory_id],
        row_to_parts,
    )
    .optional()?
    .map(into_fragment)
    .transpose()
}

/// All fragments of `source`, in document order.
pub fn memories_for_source(conn: &Connection, source: &str) -> Result<Vec<MemoryWithMeta>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM memories WHERE source = ?1 ORDER BY start_line, created_at"
    ))?;
    let rows = stmt
        .query_map(params![source], row_to_parts)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_fragment).collect()
}

/// Hash of the content last ingested for `source`.
pub fn source_hash(conn: &Connection, source: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT hash FROM sources WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_source_hash(conn: &Connection, source: &str, hash: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sources (source, hash, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(source) DO UPDATE SET hash = excluded.hash, updated_at = excluded.updated_at",
        params![source, hash, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}

pub(crate) const COLUMNS: &str =
    "id, source, scope, content, watch_source, start_line, end_line, memory, created_at";

pub(crate) struct FragmentRow {
    id: String,
    source: String,
    scope: String,
    content: String,
    watch_source: bool,
    start_line: i64,
    end_line: i64,
    memory: String,
    created_at: String,
}

pub(crate) fn row_to_parts(row: &Row<'_>) -> rusqlite::Result<FragmentRow> {
    Ok(FragmentRow {
        id: row.get(0)?,
        source: row.get(1)?,
        scope: row.get(2)?,
        content: row.get(3)?,
        watch_source: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        memory: row.get(7)?,
        created_at: row.get(8)?,
    })
}

pub(crate) fn into_fragment(row: FragmentRow) -> Result<MemoryWithMeta> {
    let mut memory: Memory = serde_json::from_str(&row.memory)
        .with_context(|| format!("corrupt memory record {}", row.id))?;
    memory.start_line = row.start_line.max(0) as usize;
    memory.end_line = row.end_line.max(0) as usize;
    let timestamp = chrono::DateTime::parse_from_rfc3339(&row.created_at)
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());
    Ok(MemoryWithMeta {
        id: row.id,
        memory,
        meta: MemoryMeta {
            source: row.source,
            content: row.content,
            watch_source: row.watch_source,
            scope: row.scope,
            timestamp,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn fragment(source: &str, start: usize, end: usize, title: &str) -> MemoryWithMeta {
        MemoryWithMeta::new(
            Memory {
                start_line: start,
                end_line: end,
                title: title.into(),
                relevant_questions: vec![format!("what is {title}?")],
                tags: vec![],
                context: None,
                symbol_id: None,
            },
            MemoryMeta::new(source, "body", "root", false),
        )
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn insert_and_read_back() {
        let mut conn = db::open_memory_database(4).unwrap();
        let f = fragment("doc", 2, 4, "intro");
        insert_memory(
            &mut conn,
            &f,
            &[("doc: intro".into(), unit(4, 0)), ("doc: what is intro?".into(), unit(4, 1))],
        )
        .unwrap();

        let read = get_memory(&conn, &f.id).unwrap().unwrap();
        assert_eq!(read.memory, f.memory);
        assert_eq!(read.meta.source, "doc");

        let keys: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_keys_vec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(keys, 2);

        let ops: Vec<String> = conn
            .prepare("SELECT operation FROM memory_log WHERE memory_id = ?1")
            .unwrap()
            .query_map(params![f.id], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ops, vec!["create"]);
    }

    #[test]
    fn source_listing_is_in_document_order() {
        let mut conn = db::open_memory_database(4).unwrap();
        for (start, title) in [(10, "b"), (1, "a")] {
            insert_memory(&mut conn, &fragment("doc", start, start, title), &[]).unwrap();
        }
        insert_memory(&mut conn, &fragment("other", 1, 1, "x"), &[]).unwrap();

        let titles: Vec<String> = memories_for_source(&conn, "doc")
            .unwrap()
            .into_iter()
            .map(|m| m.memory.title)
            .collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[test]
    fn update_and_delete() {
        let mut conn = db::open_memory_database(4).unwrap();
        let f = fragment("doc", 1, 2, "intro");
        insert_memory(&mut conn, &f, &[("doc: intro".into(), unit(4, 2))]).unwrap();

        update_line_range(&conn, &f.id, 5, 6).unwrap();
        let moved = get_memory(&conn, &f.id).unwrap().unwrap();
        assert_eq!((moved.memory.start_line, moved.memory.end_line), (5, 6));

        assert!(delete_memory(&mut conn, &f.id, "test").unwrap());
        assert!(get_memory(&conn, &f.id).unwrap().is_none());
        assert!(!delete_memory(&mut conn, &f.id, "test").unwrap());
        let vectors: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_keys_vec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(vectors, 0);
    }

    #[test]
    fn source_hash_upserts() {
        let conn = db::open_memory_database(4).unwrap();
        assert!(source_hash(&conn, "doc").unwrap().is_none());
        set_source_hash(&conn, "doc", "aa").unwrap();
        set_source_hash(&conn, "doc", "bb").unwrap();
        assert_eq!(source_hash(&conn, "doc").unwrap().as_deref(), Some("bb"));
    }
}
