//! Conversation trees for LLM agents, with context fitting and semantic memory.
//!
//! Arbor keeps every conversation as a tree of persisted records. Conversations can be forked
//! at any message or nested below one (a tool running a sub-agent), and every change to a
//! message is streamed to subscribed observers as it happens. Before each completion the
//! history is fitted into the model's context window: older turns are filed into a semantic
//! memory store and replaced by one-line outlines, which the model can expand again through
//! the `find_memory` tool.
//!
//! # Architecture
//!
//! - **Tree**: an arena [`Registry`](tree::Registry) of conversation and message records,
//!   persisted as JSON files and shared as `Arc<Registry>`
//! - **Streaming**: deltas merged into a JSON record and fanned out per message and
//!   conversation id, with cooperative cancellation checkpoints
//! - **Memory**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector
//!   search over fragment titles and questions, scoped along the conversation path
//! - **Services**: OpenAI-compatible chat completions and embeddings over HTTP
//!
//! # Modules
//!
//! - [`tree`]: conversations, messages, the registry and record persistence
//! - [`stream`]: the delta merger and stream collector
//! - [`context`]: fitting a conversation into its token budget
//! - [`memory`]: ingestion, validity tracking and scoped retrieval of fragments
//! - [`agent`] and [`tools`]: the completion loop and the functions the model may call
//! - [`provider`] and [`embedding`]: completion and embedding services
//! - [`config`], [`db`], [`error`], [`chat`], [`tokens`]: supporting pieces

pub mod agent;
pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod provider;
pub mod stream;
pub mod tokens;
pub mod tools;
pub mod tree;

pub use chat::{Chat, FunctionCall, FunctionSchema, Role};
pub use error::{ConsumerError, Error, Result};
pub use stream::{StreamCollector, StreamEvent};
pub use tree::{Conversation, ConversationMeta, Message, MessageMeta, MessageRecord, Registry};
