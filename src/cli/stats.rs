use anyhow::Result;

use arbor::memory::MemoryStore;
use arbor::tree::Registry;

/// Display conversation and memory statistics in the terminal.
pub fn stats(registry: &Registry, memory: &MemoryStore) -> Result<()> {
    let conversations = registry.conversations();
    let live: Vec<_> = conversations.iter().filter(|c| !c.meta.deleted).collect();
    let forks = live.iter().filter(|c| c.forked_from.is_some()).count();
    let messages: usize = live.iter().map(|c| c.message_ids.len()).sum();

    println!("Conversations");
    println!("{}", "=".repeat(40));
    println!("  Conversations:       {}", live.len());
    println!("  Forks:               {forks}");
    println!("  Messages:            {messages}");
    println!();

    let response = memory.stats()?;
    println!("Memory");
    println!("{}", "=".repeat(40));
    println!("  Total memories:      {}", response.total_memories);
    println!("  Watched:             {}", response.watched_memories);
    println!("  Sources:             {}", response.sources);
    println!("  Index keys:          {}", response.index_keys);
    println!("  Log entries:         {}", response.log_entries);
    println!();

    if !response.by_scope.is_empty() {
        println!("By Scope:");
        for (scope, count) in &response.by_scope {
            println!("  {:<12} {}", scope, count);
        }
        println!();
    }

    println!("Database size:         {} bytes", response.db_size_bytes);
    if let Some(ref oldest) = response.oldest_memory {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = response.newest_memory {
        println!("Newest memory:         {newest}");
    }
    Ok(())
}
