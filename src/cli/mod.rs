pub mod ask;
pub mod ingest;
pub mod recall;
pub mod show;
pub mod stats;
pub mod tree;

use anyhow::{Context, Result};
use std::sync::Arc;

use arbor::config::ArborConfig;
use arbor::memory::extract::LlmExtractor;
use arbor::memory::MemoryStore;
use arbor::provider::openai::OpenAiClient;
use arbor::provider::RetryPolicy;
use arbor::tree::{FileStore, Registry};

/// Open the conversation tree under the configured save directory.
pub fn open_registry(config: &ArborConfig) -> Result<Arc<Registry>> {
    let save_dir = config.resolved_save_dir();
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("failed to create save dir: {}", save_dir.display()))?;
    let registry = Registry::open(Arc::new(FileStore::new(&save_dir)))
        .with_context(|| format!("failed to load conversations from {}", save_dir.display()))?;
    Ok(registry)
}

/// Open the memory index with the configured embedding and completion services.
pub fn open_memory(config: &ArborConfig, completion: Arc<OpenAiClient>) -> Result<Arc<MemoryStore>> {
    let db_path = config.resolved_memory_db();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let embedder = Arc::from(arbor::embedding::create_provider(&config.embedding)?);
    let extractor = Arc::new(
        LlmExtractor::new(completion, config.extraction.clone())
            .with_retry(RetryPolicy::from(&config.completion)),
    );
    let store = MemoryStore::open(&db_path, embedder, extractor)?;
    Ok(Arc::new(store))
}

/// First line of `text`, at most `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let mut out: String = line.chars().take(max).collect();
    if out.len() < line.len() || text.trim().lines().count() > 1 {
        out.push_str("...");
    }
    out
}
