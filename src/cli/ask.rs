use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

use arbor::agent::Agent;
use arbor::config::ArborConfig;
use arbor::context::ContextFitter;
use arbor::memory::MemoryStore;
use arbor::provider::openai::OpenAiClient;
use arbor::stream::StreamEvent;
use arbor::tools::FindMemory;
use arbor::tree::{ChannelConsumer, Conversation, ConversationMeta, Registry};

use super::preview;

/// Run one agent turn, printing the answer as it streams. Ctrl-C cancels the turn.
pub async fn ask(
    config: &ArborConfig,
    registry: &Arc<Registry>,
    completion: Arc<OpenAiClient>,
    memory: Arc<MemoryStore>,
    conversation: Option<&str>,
    task: &str,
) -> Result<()> {
    let conversation = match conversation {
        Some(id) => Conversation::open(registry, id)?,
        None => {
            let meta = ConversationMeta::tagged("title", preview(task, 40));
            let conversation = Conversation::create(registry, meta)?;
            conversation.set_context_size(config.context.context_size)?;
            conversation
        }
    }
    .with_memory(memory);
    eprintln!("conversation {}", conversation.id());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = registry.add_consumer(conversation.id(), Arc::new(ChannelConsumer::new(tx)));
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Chunk { diff, .. } = event {
                if let Some(text) = diff.get("content").and_then(|c| c.as_str()) {
                    let _ = write!(stdout, "{text}");
                    let _ = stdout.flush();
                }
            }
        }
    });

    let agent = Agent::new(completion, ContextFitter::new(config.context.clone()))
        .with_tool(FindMemory::new(config.retrieval.default_num_results));

    let run = agent.run(&conversation, task);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            // The run stops at its next checkpoint.
            registry.cancel(conversation.id());
            run.await
        }
    };
    registry.unsubscribe(conversation.id(), subscription);
    printer.await?;
    println!();

    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_cancelled() => {
            eprintln!("cancelled");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
