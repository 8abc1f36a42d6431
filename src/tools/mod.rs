//! Functions the model can call during an agent run.
//!
//! A [`Tool`] pairs a [`FunctionSchema`] with an async handler. Handlers receive the raw JSON
//! argument string; malformed arguments are reported back to the model as the function
//! result instead of failing the run.

pub mod find_memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::chat::FunctionSchema;
use crate::error::Result;
use crate::tree::Conversation;

pub use find_memory::{FindMemory, FindMemoryParams, FIND_MEMORY, MAX_RESULTS};

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> FunctionSchema;

    /// Handle one call made from `conversation`. The returned text becomes the content of
    /// the function message.
    async fn call(&self, conversation: &Conversation, arguments: &str) -> Result<String>;
}

/// Deserialize tool arguments, or describe the problem for the model.
///
/// An empty argument string is read as `{}`.
pub fn parse_arguments<T: DeserializeOwned>(
    tool: &str,
    arguments: &str,
) -> std::result::Result<T, String> {
    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(raw).map_err(|e| format!("Invalid arguments for {tool}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_arguments_become_a_message() {
        let err = parse_arguments::<FindMemoryParams>(FIND_MEMORY, "{\"num_results\": 3}")
            .unwrap_err();
        assert!(err.starts_with("Invalid arguments for find_memory"));
        assert!(err.contains("question"));

        let err = parse_arguments::<FindMemoryParams>(FIND_MEMORY, "not json").unwrap_err();
        assert!(err.contains("find_memory"));
    }

    #[test]
    fn valid_arguments_parse() {
        let params: FindMemoryParams =
            parse_arguments(FIND_MEMORY, r#"{"question": "where is the config?"}"#).unwrap();
        assert_eq!(params.question, "where is the config?");
        assert_eq!(params.num_results, None);
    }
}
