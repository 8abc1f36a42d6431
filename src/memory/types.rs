//! Memory fragment types.
//!
//! A fragment is split in two halves: [`Memory`] is what the extractor produces (title, line
//! range, questions it answers) and [`MemoryMeta`] is what the store knows about its origin
//! (source, verbatim content, scope). [`MemoryWithMeta`] pairs them under a generated id.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Scope visible from every conversation.
pub const GLOBAL_SCOPE: &str = "root";

/// One atomic, self-contained piece of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Memory {
    /// The line number where the memory starts in the document.
    pub start_line: usize,
    /// The line number where the memory ends in the document (inclusive).
    pub end_line: usize,
    /// The title of this memory. Plain, unformatted text without links.
    pub title: String,
    /// Questions answered by the content of this memory. The memory is found later by matching
    /// arbitrary questions against these.
    #[serde(default)]
    pub relevant_questions: Vec<String>,
    /// Keywords describing the memory.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Information from earlier sections needed to understand the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// For source code: the symbol described by this memory, e.g. `src/agent.rs:Agent::run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_id: Option<String>,
}

impl Memory {
    /// Number of lines covered.
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// Where a fragment came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMeta {
    /// Source identifier: a file path for watched sources, any label otherwise.
    pub source: String,
    /// Exact verbatim content of the fragment.
    pub content: String,
    /// Whether the source is re-read to check the fragment is still current.
    pub watch_source: bool,
    /// Conversation id the fragment is visible under, or [`GLOBAL_SCOPE`].
    pub scope: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryMeta {
    pub fn new(source: &str, content: &str, scope: &str, watch_source: bool) -> Self {
        Self {
            source: source.to_string(),
            content: content.to_string(),
            watch_source,
            scope: scope.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A stored fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWithMeta {
    /// UUID v7 primary key.
    pub id: String,
    pub memory: Memory,
    pub meta: MemoryMeta,
}

impl MemoryWithMeta {
    pub fn new(memory: Memory, meta: MemoryMeta) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            memory,
            meta,
        }
    }

    /// Index keys this fragment is embedded under: its title and each relevant question,
    /// prefixed with the source so identical questions from different sources stay distinct.
    pub fn index_keys(&self) -> Vec<String> {
        std::iter::once(&self.memory.title)
            .chain(&self.memory.relevant_questions)
            .map(|key| format!("{}: {}", self.meta.source, key))
            .collect()
    }

    /// Whether this fragment is visible from a caller whose ancestor ids are `scope_chain`.
    pub fn visible_from(&self, scope_chain: &[String]) -> bool {
        self.meta.scope == GLOBAL_SCOPE || scope_chain.iter().any(|s| *s == self.meta.scope)
    }
}

/// A retrieval hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: MemoryWithMeta,
    /// Cosine similarity between the question and the best matching key.
    pub score: f64,
    /// The key that matched.
    pub matched_key: String,
}
