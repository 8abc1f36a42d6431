use anyhow::Result;
use serde_json::Value;

use arbor::tree::{ConversationRecord, Registry, ROOT};

use super::preview;

/// Print every conversation with its messages, forks and nested conversations.
pub fn tree(registry: &Registry) -> Result<()> {
    let top = registry.children_of(ROOT);
    if top.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for id in top {
        if let Some(record) = registry.conversation(&id) {
            print_conversation(registry, &record, 0);
        }
    }
    Ok(())
}

fn print_conversation(registry: &Registry, record: &ConversationRecord, depth: usize) {
    if record.meta.deleted {
        return;
    }
    let indent = "  ".repeat(depth);
    let kind = if record.forked_from.is_some() {
        "fork"
    } else {
        "conversation"
    };
    let title = record
        .meta
        .tags
        .get("title")
        .and_then(Value::as_str)
        .map(|t| format!(" \"{t}\""))
        .unwrap_or_default();
    println!(
        "{indent}{kind} {}{title} ({} messages, {})",
        record.id(),
        record.message_ids.len(),
        record.meta.timestamp.format("%Y-%m-%d %H:%M")
    );

    for id in &record.message_ids {
        let Some(message) = registry.message(id) else {
            continue;
        };
        if message.meta.deleted {
            continue;
        }
        println!(
            "{indent}  {id} {:<9} {}",
            message.chat.role().as_str(),
            preview(message.chat.content(), 60)
        );
        for child in registry.children_of(id) {
            if let Some(nested) = registry.conversation(&child) {
                print_conversation(registry, &nested, depth + 2);
            }
        }
    }
}
