//! Semantic memory: ingestion, validity tracking and scoped retrieval of fragments.
//!
//! [`MemoryStore`] owns the SQLite index and the two services it needs: an
//! [`EmbeddingProvider`] for index keys and queries, and a [`MemoryExtractor`] that cuts
//! documents into fragments. Service calls happen outside the database lock.

pub mod document;
pub mod extract;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;
pub mod validity;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::embedding::{normalize, EmbeddingProvider};
use extract::MemoryExtractor;
use types::{Memory, MemoryMeta, MemoryWithMeta, ScoredMemory};
use validity::Validity;

pub use types::GLOBAL_SCOPE;

pub struct MemoryStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn MemoryExtractor>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("db_path", &self.db_path)
            .field("dimensions", &self.embedder.dimensions())
            .finish()
    }
}

/// SHA-256 of `content`, hex encoded.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

impl MemoryStore {
    pub fn new(
        conn: Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn MemoryExtractor>,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            db_path: None,
            embedder,
            extractor,
        }
    }

    /// Open (or create) the index at `path`, sized for `embedder`.
    pub fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn MemoryExtractor>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let conn = crate::db::open_database(path, embedder.dimensions())?;
        Ok(Self {
            db_path: Some(path.to_path_buf()),
            ..Self::new(conn, embedder, extractor)
        })
    }

    /// A throwaway in-memory index.
    pub fn in_memory(
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn MemoryExtractor>,
    ) -> Result<Self> {
        let conn = crate::db::open_memory_database(embedder.dimensions())?;
        Ok(Self::new(conn, embedder, extractor))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("memory database lock poisoned: {e}"))?;
        f(&mut conn)
    }

    async fn embed_keys(&self, keys: Vec<String>) -> Result<Vec<(String, Vec<f32>)>> {
        let mut vectors = self.embedder.embed_batch(&keys).await?;
        vectors.iter_mut().for_each(|v| normalize(v));
        anyhow::ensure!(
            vectors.len() == keys.len(),
            "embedding provider returned {} vectors for {} keys",
            vectors.len(),
            keys.len()
        );
        Ok(keys.into_iter().zip(vectors).collect())
    }

    async fn insert(&self, fragment: &MemoryWithMeta) -> Result<()> {
        let keys = self.embed_keys(fragment.index_keys()).await?;
        self.with_conn(|conn| store::insert_memory(conn, fragment, &keys))
    }

    /// Ingest `content` under `source` and return all fragments of the source.
    ///
    /// Unchanged content (same hash as the last ingestion) is a no-op. Otherwise existing
    /// fragments are revalidated against the new content first, then the extractor adds
    /// fragments for whatever is not yet covered.
    pub async fn ingest(
        &self,
        content: &str,
        source: &str,
        scope: &str,
        watch_source: bool,
    ) -> Result<Vec<MemoryWithMeta>> {
        let hash = content_hash(content);
        let (unchanged, existing) = self.with_conn(|conn| {
            if store::source_hash(conn, source)?.as_deref() == Some(hash.as_str()) {
                return Ok((true, store::memories_for_source(conn, source)?));
            }
            Ok((false, revalidate(conn, source, content)?))
        })?;
        if unchanged {
            tracing::debug!(source, "content unchanged, skipping ingestion");
            return Ok(existing);
        }

        let extracted = self
            .extractor
            .extract(content, &existing)
            .await
            .with_context(|| format!("failed to extract memories from {source}"))?;

        let mut added = 0;
        for memory in extracted {
            let Some(text) = document::line_range(content, memory.start_line, memory.end_line)
            else {
                tracing::warn!(source, title = %memory.title, "memory outside document, skipped");
                continue;
            };
            let fragment =
                MemoryWithMeta::new(memory, MemoryMeta::new(source, &text, scope, watch_source));
            self.insert(&fragment).await?;
            added += 1;
        }

        let fragments = self.with_conn(|conn| {
            store::set_source_hash(conn, source, &hash)?;
            store::memories_for_source(conn, source)
        })?;
        tracing::info!(
            source,
            scope,
            added,
            total = fragments.len(),
            "source ingested"
        );
        Ok(fragments)
    }

    /// Store `content` as one fragment described by the extractor.
    pub async fn add_memory(
        &self,
        content: &str,
        source: &str,
        scope: &str,
    ) -> Result<MemoryWithMeta> {
        let memory: Memory = self
            .extractor
            .describe(content)
            .await
            .with_context(|| format!("failed to describe {source}"))?;
        let fragment =
            MemoryWithMeta::new(memory, MemoryMeta::new(source, content, scope, false));
        self.insert(&fragment).await?;
        tracing::debug!(source, scope, memory = %fragment.id, "memory added");
        Ok(fragment)
    }

    /// At most `num_results` fragments relevant to `question`, visible from `scope_chain`,
    /// best first and without duplicates.
    ///
    /// Fragments of watched sources are revalidated; if any failed, the stale sources are
    /// re-ingested (or dropped when unreadable) and the lookup runs once more.
    pub async fn retrieve(
        &self,
        question: &str,
        num_results: usize,
        scope_chain: &[String],
    ) -> Result<Vec<ScoredMemory>> {
        if num_results == 0 {
            return Ok(Vec::new());
        }
        let mut query = self.embedder.embed(question).await?;
        normalize(&mut query);

        let candidates_wanted = num_results.saturating_mul(2).min(search::MAX_KNN);
        for attempt in 0..2 {
            let candidates = self.with_conn(|conn| {
                let hits = search::nearest_keys(conn, &query, candidates_wanted)?;
                search::resolve_hits(conn, hits, scope_chain)
            })?;

            let (mut results, stale) = self.validate(candidates).await?;
            if stale.is_empty() || attempt == 1 {
                results.truncate(num_results);
                tracing::debug!(question, results = results.len(), "memories retrieved");
                return Ok(results);
            }
            tracing::info!(sources = stale.len(), "stale memories found, refreshing sources");
            for (source, scope) in stale {
                self.refresh_source(&source, &scope).await?;
            }
        }
        Ok(Vec::new())
    }

    /// Split candidates into still-valid results and stale `(source, scope)` pairs.
    async fn validate(
        &self,
        candidates: Vec<ScoredMemory>,
    ) -> Result<(Vec<ScoredMemory>, HashMap<String, String>)> {
        let mut sources: HashMap<String, Option<String>> = HashMap::new();
        let mut results = Vec::with_capacity(candidates.len());
        let mut stale = HashMap::new();

        for mut candidate in candidates {
            let meta = &candidate.memory.meta;
            if !meta.watch_source {
                results.push(candidate);
                continue;
            }
            if !sources.contains_key(&meta.source) {
                let text = tokio::fs::read_to_string(&meta.source).await.ok();
                sources.insert(meta.source.clone(), text);
            }
            let current = sources.get(&meta.source).and_then(Option::as_deref);
            match current.map(|text| validity::check(&candidate.memory, text)) {
                Some(Validity::Valid) => results.push(candidate),
                Some(Validity::Moved {
                    start_line,
                    end_line,
                }) => {
                    let id = candidate.memory.id.clone();
                    self.with_conn(|conn| {
                        store::update_line_range(conn, &id, start_line, end_line)
                    })?;
                    candidate.memory.memory.start_line = start_line;
                    candidate.memory.memory.end_line = end_line;
                    results.push(candidate);
                }
                Some(Validity::Gone) | None => {
                    stale.insert(meta.source.clone(), meta.scope.clone());
                }
            }
        }
        Ok((results, stale))
    }

    /// Re-ingest a watched source from disk, or drop its fragments if it cannot be read.
    async fn refresh_source(&self, source: &str, scope: &str) -> Result<()> {
        match tokio::fs::read_to_string(source).await {
            Ok(content) => {
                if let Err(err) = self.ingest(&content, source, scope, true).await {
                    tracing::warn!(source, error = %err, "re-ingestion failed, evicting");
                    self.evict_source(source)?;
                }
            }
            Err(err) => {
                tracing::warn!(source, error = %err, "source unreadable, evicting its memories");
                self.evict_source(source)?;
            }
        }
        Ok(())
    }

    fn evict_source(&self, source: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let fragments = store::memories_for_source(conn, source)?;
            for fragment in &fragments {
                store::delete_memory(conn, &fragment.id, "source unreadable")?;
            }
            conn.execute(
                "DELETE FROM sources WHERE source = ?1",
                rusqlite::params![source],
            )?;
            Ok(fragments.len())
        })
    }

    /// Re-read a watched source and revalidate its fragments without extracting new ones.
    /// Returns the number of fragments evicted.
    pub async fn validate_source(&self, source: &str) -> Result<usize> {
        match tokio::fs::read_to_string(source).await {
            Ok(content) => {
                let before = self.memories_for_source(source)?.len();
                let kept = self.with_conn(|conn| revalidate(conn, source, &content))?;
                Ok(before.saturating_sub(kept.len()))
            }
            Err(_) => self.evict_source(source),
        }
    }

    /// Remove one fragment. Returns `false` if it did not exist.
    pub fn forget(&self, memory_id: &str) -> Result<bool> {
        self.with_conn(|conn| store::delete_memory(conn, memory_id, "forgotten"))
    }

    pub fn get(&self, memory_id: &str) -> Result<Option<MemoryWithMeta>> {
        self.with_conn(|conn| store::get_memory(conn, memory_id))
    }

    pub fn memories_for_source(&self, source: &str) -> Result<Vec<MemoryWithMeta>> {
        self.with_conn(|conn| store::memories_for_source(conn, source))
    }

    /// Fragments scoped exactly to `scope`.
    pub fn memories_in_scope(&self, scope: &str) -> Result<Vec<MemoryWithMeta>> {
        self.with_conn(|conn| search::memories_in_scope(conn, scope))
    }

    pub fn stats(&self) -> Result<stats::StatsResponse> {
        let db_path = self.db_path.clone();
        self.with_conn(|conn| stats::memory_stats(conn, db_path.as_deref()))
    }
}

/// Evict fragments of `source` missing from `content`, move shifted ones, return survivors.
fn revalidate(conn: &mut Connection, source: &str, content: &str) -> Result<Vec<MemoryWithMeta>> {
    let mut kept = Vec::new();
    let mut seen_content = HashSet::new();
    for mut fragment in store::memories_for_source(conn, source)? {
        match validity::check(&fragment, content) {
            Validity::Valid => {}
            Validity::Moved {
                start_line,
                end_line,
            } => {
                store::update_line_range(conn, &fragment.id, start_line, end_line)?;
                fragment.memory.start_line = start_line;
                fragment.memory.end_line = end_line;
            }
            Validity::Gone => {
                tracing::debug!(source, memory = %fragment.id, "memory content gone, evicting");
                store::delete_memory(conn, &fragment.id, "content no longer in source")?;
                continue;
            }
        }
        // Two fragments resolving to the same text and range are one memory.
        if !seen_content.insert((
            fragment.memory.start_line,
            fragment.memory.end_line,
            fragment.meta.content.clone(),
        )) {
            store::delete_memory(conn, &fragment.id, "duplicate after source shift")?;
            continue;
        }
        kept.push(fragment);
    }
    Ok(kept)
}
