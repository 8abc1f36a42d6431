//! `find_memory` tool: recall memory fragments visible from the calling conversation.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{parse_arguments, Tool};
use crate::chat::FunctionSchema;
use crate::error::Result;
use crate::memory::types::ScoredMemory;
use crate::tree::Conversation;

pub const FIND_MEMORY: &str = "find_memory";

/// Upper bound on `num_results` a model may ask for.
pub const MAX_RESULTS: usize = 20;

/// Parameters for the `find_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct FindMemoryParams {
    /// What to recall, phrased as a question or keywords.
    #[schemars(description = "Question or keywords describing what to recall.")]
    pub question: String,

    /// Maximum number of fragments to return (1-20).
    #[schemars(description = "Maximum number of memories to return (1-20). Defaults to 5.")]
    pub num_results: Option<usize>,
}

/// A recalled fragment as shown to the model.
#[derive(Debug, Serialize)]
struct Recalled<'a> {
    id: &'a str,
    title: &'a str,
    source: &'a str,
    lines: String,
    score: f64,
    content: &'a str,
}

impl<'a> From<&'a ScoredMemory> for Recalled<'a> {
    fn from(hit: &'a ScoredMemory) -> Self {
        let fragment = &hit.memory;
        Self {
            id: &fragment.id,
            title: &fragment.memory.title,
            source: &fragment.meta.source,
            lines: format!("{}-{}", fragment.memory.start_line, fragment.memory.end_line),
            score: (hit.score * 1000.0).round() / 1000.0,
            content: &fragment.meta.content,
        }
    }
}

pub struct FindMemory {
    default_num_results: usize,
}

impl FindMemory {
    pub fn new(default_num_results: usize) -> Self {
        Self {
            default_num_results: default_num_results.clamp(1, MAX_RESULTS),
        }
    }
}

impl Default for FindMemory {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl Tool for FindMemory {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema::for_type::<FindMemoryParams>(
            FIND_MEMORY,
            "Recall memories stored from documents and earlier parts of this conversation.",
        )
    }

    async fn call(&self, conversation: &Conversation, arguments: &str) -> Result<String> {
        let params: FindMemoryParams = match parse_arguments(FIND_MEMORY, arguments) {
            Ok(params) => params,
            Err(message) => return Ok(message),
        };
        if params.question.trim().is_empty() {
            return Ok("Invalid arguments for find_memory: question must not be empty".into());
        }
        let Some(memory) = conversation.memory() else {
            return Ok("No memory is available in this conversation.".into());
        };
        let num_results = params
            .num_results
            .unwrap_or(self.default_num_results)
            .clamp(1, MAX_RESULTS);

        tracing::info!(
            conversation = %conversation.id(),
            question = %params.question,
            num_results,
            "find_memory called"
        );
        let hits = memory
            .retrieve(&params.question, num_results, conversation.path())
            .await?;
        if hits.is_empty() {
            return Ok("No matching memories found.".into());
        }
        let recalled: Vec<Recalled<'_>> = hits.iter().map(Recalled::from).collect();
        Ok(serde_json::to_string_pretty(&recalled)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_describes_question() {
        let schema = FindMemory::default().schema();
        assert_eq!(schema.name, FIND_MEMORY);
        assert!(schema.parameters["properties"]["question"].is_object());
        assert!(schema.parameters["properties"]["num_results"].is_object());
    }

    #[test]
    fn default_results_are_clamped() {
        assert_eq!(FindMemory::new(0).default_num_results, 1);
        assert_eq!(FindMemory::new(100).default_num_results, MAX_RESULTS);
    }
}
