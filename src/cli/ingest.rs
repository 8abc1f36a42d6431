use anyhow::{Context, Result};
use std::path::Path;

use arbor::memory::{MemoryStore, GLOBAL_SCOPE};

/// Ingest a file as a watched source. Later retrievals revalidate it against the file.
pub async fn ingest(memory: &MemoryStore, path: &Path, scope: Option<&str>) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let source = path.to_string_lossy();
    let scope = scope.unwrap_or(GLOBAL_SCOPE);

    let fragments = memory.ingest(&content, &source, scope, true).await?;
    println!("{} memory(ies) for {source}", fragments.len());
    for fragment in &fragments {
        println!(
            "  {:>5}-{:<5} {}",
            fragment.memory.start_line, fragment.memory.end_line, fragment.memory.title
        );
    }
    Ok(())
}
