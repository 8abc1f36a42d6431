use anyhow::Result;
use std::sync::Arc;

use arbor::tree::{Conversation, Registry};

/// Print the effective messages of a conversation.
pub fn show(registry: &Arc<Registry>, id: &str, json: bool) -> Result<()> {
    let conversation = Conversation::open(registry, id)?;
    let messages = conversation.messages()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    let record = conversation.record()?;
    println!("Conversation {}", conversation.id());
    println!("{}", "=".repeat(40));
    println!("  Path:          {}", record.path.join("/"));
    if let Some(from) = &record.forked_from {
        println!("  Forked from:   {}", from.join("/"));
    }
    println!("  Context size:  {}", record.context_size);
    println!("  Messages:      {}", messages.len());
    println!();

    for message in &messages {
        let mut flags = Vec::new();
        if message.meta.is_initial {
            flags.push("initial".to_string());
        }
        if let Some(action) = message.action() {
            flags.push(format!("action={action}"));
        }
        if !message.meta.memories.is_empty() {
            flags.push(format!("memories={}", message.meta.memories.len()));
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!(
            "--- {} {} (~{} tokens){flags}",
            message.id(),
            message.chat.role(),
            message.tokens()
        );
        if let Some(outline) = message.meta.outline.as_deref().filter(|o| !o.is_empty()) {
            println!("outline: {outline}");
        }
        if let Some(call) = message.chat.function_call() {
            println!("-> {}({})", call.name, call.arguments);
        }
        if !message.chat.content().is_empty() {
            println!("{}", message.chat.content());
        }
        println!();
    }
    Ok(())
}
