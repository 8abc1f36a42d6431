use anyhow::Result;

use arbor::memory::MemoryStore;
use arbor::tree::{Registry, ROOT};

use super::preview;

/// Retrieve memories for `question`, as seen from `conversation` (or globally).
pub async fn recall(
    memory: &MemoryStore,
    registry: &Registry,
    question: &str,
    num_results: usize,
    conversation: Option<&str>,
) -> Result<()> {
    let scope_chain = match conversation {
        Some(id) => registry
            .path_of(id)
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {id}"))?,
        None => vec![ROOT.to_string()],
    };

    let results = memory.retrieve(question, num_results, &scope_chain).await?;
    if results.is_empty() {
        println!("No memories found.");
        return Ok(());
    }

    println!("Found {} memory(ies)\n", results.len());
    for (i, hit) in results.iter().enumerate() {
        let fragment = &hit.memory;
        println!(
            "  {}. {} (score: {:.4}, scope: {})",
            i + 1,
            fragment.memory.title,
            hit.score,
            fragment.meta.scope
        );
        println!(
            "     {}:{}-{}  matched \"{}\"",
            fragment.meta.source,
            fragment.memory.start_line,
            fragment.memory.end_line,
            hit.matched_key
        );
        println!("     {}", preview(&fragment.meta.content, 120));
        println!("     id: {}", fragment.id);
        println!();
    }
    Ok(())
}
