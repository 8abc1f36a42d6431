//! Read path: KNN over index keys, scope filtering and per-fragment deduplication.

use std::collections::HashSet;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{embedding_to_bytes, l2_to_cosine};
use crate::memory::store::{get_memory, into_fragment, row_to_parts, COLUMNS};
use crate::memory::types::{MemoryWithMeta, ScoredMemory};

/// Largest `k` sqlite-vec accepts in a KNN query.
pub const MAX_KNN: usize = 4096;

/// A matched index key.
#[derive(Debug, Clone)]
pub struct KeyHit {
    pub memory_id: String,
    pub key: String,
    pub score: f64,
}

/// The `limit` keys closest to `embedding`, best first. `limit` is capped at [`MAX_KNN`].
pub fn nearest_keys(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<KeyHit>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let limit = limit.min(MAX_KNN);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memory_keys_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let neighbours: Vec<(String, f64)> = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut hits = Vec::with_capacity(neighbours.len());
    for (key_id, distance) in neighbours {
        let key: Option<(String, String)> = conn
            .query_row(
                "SELECT memory_id, key FROM memory_keys WHERE id = ?1",
                params![key_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((memory_id, key)) = key {
            hits.push(KeyHit {
                memory_id,
                key,
                score: l2_to_cosine(distance),
            });
        }
    }
    Ok(hits)
}

/// Resolve key hits into fragments visible from `scope_chain`, keeping only the first (best)
/// hit per fragment.
pub fn resolve_hits(
    conn: &Connection,
    hits: Vec<KeyHit>,
    scope_chain: &[String],
) -> Result<Vec<ScoredMemory>> {
    let mut seen = HashSet::new();
    let mut results = Vec::new();
    for hit in hits {
        if !seen.insert(hit.memory_id.clone()) {
            continue;
        }
        let Some(memory) = get_memory(conn, &hit.memory_id)? else {
            continue;
        };
        if !memory.visible_from(scope_chain) {
            tracing::trace!(memory = %memory.id, scope = %memory.meta.scope, "out of scope");
            continue;
        }
        results.push(ScoredMemory {
            memory,
            score: hit.score,
            matched_key: hit.key,
        });
    }
    Ok(results)
}

/// Fragments whose scope is exactly `scope` (a conversation id or the global scope).
pub fn memories_in_scope(conn: &Connection, scope: &str) -> Result<Vec<MemoryWithMeta>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM memories WHERE scope = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map(params![scope], row_to_parts)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_fragment).collect()
}
