mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use arbor::config::ArborConfig;
use arbor::provider::openai::OpenAiClient;

#[derive(Parser)]
#[command(name = "arbor", version, about = "Conversation trees with context fitting and semantic memory")]
struct Cli {
    /// Config file (defaults to ~/.arbor/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the conversation tree
    Tree,
    /// Print the effective messages of a conversation
    Show {
        id: String,
        /// Print the raw message records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Retrieve memories relevant to a question
    Recall {
        question: String,
        /// Maximum number of results (1-20)
        #[arg(short = 'n', long)]
        num_results: Option<usize>,
        /// Search as seen from this conversation (defaults to global memories only)
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Show conversation and memory statistics
    Stats,
    /// Ingest a file into memory; it is revalidated against the file on retrieval
    Ingest {
        path: PathBuf,
        /// Scope of the new memories (defaults to global)
        #[arg(long)]
        scope: Option<String>,
    },
    /// Ask the agent, starting a new conversation or continuing one
    Ask {
        task: String,
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ArborConfig::load_from(path)?,
        None => ArborConfig::load()?,
    };

    // Log to stderr so stdout carries only command output.
    let filter = EnvFilter::try_new(&config.logging.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let registry = cli::open_registry(&config)?;

    match cli.command {
        Command::Tree => cli::tree::tree(&registry)?,
        Command::Show { id, json } => cli::show::show(&registry, &id, json)?,
        Command::Recall {
            question,
            num_results,
            conversation,
        } => {
            let memory = cli::open_memory(&config, Arc::new(OpenAiClient::new(&config.completion)?))?;
            let num_results = num_results
                .unwrap_or(config.retrieval.default_num_results)
                .clamp(1, arbor::tools::MAX_RESULTS);
            cli::recall::recall(&memory, &registry, &question, num_results, conversation.as_deref())
                .await?;
        }
        Command::Stats => {
            let memory = cli::open_memory(&config, Arc::new(OpenAiClient::new(&config.completion)?))?;
            cli::stats::stats(&registry, &memory)?;
        }
        Command::Ingest { path, scope } => {
            let memory = cli::open_memory(&config, Arc::new(OpenAiClient::new(&config.completion)?))?;
            cli::ingest::ingest(&memory, &path, scope.as_deref()).await?;
        }
        Command::Ask { task, conversation } => {
            let completion = Arc::new(OpenAiClient::new(&config.completion)?);
            let memory = cli::open_memory(&config, Arc::clone(&completion))?;
            cli::ask::ask(&config, &registry, completion, memory, conversation.as_deref(), &task)
                .await?;
        }
    }

    Ok(())
}
