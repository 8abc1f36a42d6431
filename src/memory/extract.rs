//! Turning text into memory fragments.
//!
//! [`MemoryExtractor`] is the seam between the store and whatever produces fragments.
//! [`LlmExtractor`] drives the completion service with an `add_memory` function over
//! line-numbered pages of the document, one fragment per call, hiding what is already
//! memorized, until nothing worth remembering is left.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::chat::{Chat, FunctionSchema};
use crate::config::ExtractionConfig;
use crate::memory::document::{hide_already_memorized, something_to_remember, split_document};
use crate::memory::types::{Memory, MemoryWithMeta};
use crate::provider::{complete_with_retry, CompletionService, RetryPolicy};

pub const ADD_MEMORY: &str = "add_memory";

const EXTRACT_PROMPT: &str = "Turn a text into a list of memories. A memory is one piece of \
information that is self-contained but atomic. You will later generate questions or keywords \
and find the memories you create now, so remember only informative content. Every line starts \
with its line number; reference these numbers in start_line and end_line. Sections you already \
memorized are hidden and only show their title: do not memorize them again. You only see part \
of a larger text. If what remains is irrelevant or only single lines are left, answer without \
calling add_memory to end the session.";

const DESCRIBE_PROMPT: &str = "Describe the content of the text by calling add_memory once with \
structured metadata: a title, the questions it answers and a short context.";

#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    /// New fragments for `content`, not overlapping the `existing` ones.
    async fn extract(&self, content: &str, existing: &[MemoryWithMeta]) -> Result<Vec<Memory>>;

    /// A single fragment describing all of `content`.
    async fn describe(&self, content: &str) -> Result<Memory>;
}

pub struct LlmExtractor {
    service: Arc<dyn CompletionService>,
    config: ExtractionConfig,
    retry: RetryPolicy,
}

impl LlmExtractor {
    pub fn new(service: Arc<dyn CompletionService>, config: ExtractionConfig) -> Self {
        Self {
            service,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn schema() -> FunctionSchema {
        FunctionSchema::for_type::<Memory>(ADD_MEMORY, "Create a new memory.")
    }

    /// Ask for one memory from `page`. `None` when the model ended the session.
    async fn next_memory(&self, prompt: &str, page: &str) -> Result<Option<Memory>> {
        let messages = [Chat::system(prompt), Chat::user(format!("```\n{page}\n```"))];
        let reply = complete_with_retry(
            self.service.as_ref(),
            &messages,
            &[Self::schema()],
            &self.retry,
        )
        .await?;

        let Some(call) = reply.function_call().filter(|c| c.name == ADD_MEMORY) else {
            return Ok(None);
        };
        match serde_json::from_str::<Memory>(&call.arguments) {
            Ok(memory) => Ok(Some(memory)),
            Err(err) => {
                tracing::warn!(error = %err, "extractor returned malformed add_memory arguments");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MemoryExtractor for LlmExtractor {
    async fn extract(&self, content: &str, existing: &[MemoryWithMeta]) -> Result<Vec<Memory>> {
        let line_count = content.split('\n').count();
        let mut found: Vec<Memory> = Vec::new();
        let mut rounds = 0;

        'session: loop {
            let visible = hide_already_memorized(
                content,
                existing.iter().map(|m| &m.memory).chain(found.iter()),
            );
            if !something_to_remember(&visible) {
                tracing::debug!(found = found.len(), "nothing left to remember");
                break;
            }
            for page in split_document(
                &visible,
                self.config.page_tokens,
                self.config.overlap_tokens,
            ) {
                if rounds >= self.config.max_rounds {
                    tracing::warn!(rounds, "extraction round limit reached");
                    break 'session;
                }
                rounds += 1;
                let Some(memory) = self.next_memory(EXTRACT_PROMPT, &page).await? else {
                    continue;
                };
                if memory.start_line == 0
                    || memory.start_line > memory.end_line
                    || memory.end_line > line_count
                {
                    tracing::warn!(
                        start = memory.start_line,
                        end = memory.end_line,
                        lines = line_count,
                        "discarding memory with invalid line range"
                    );
                    continue;
                }
                found.push(memory);
                // The visible text changed; start over from the first page.
                continue 'session;
            }
            break;
        }
        Ok(found)
    }

    async fn describe(&self, content: &str) -> Result<Memory> {
        let memory = self
            .next_memory(DESCRIBE_PROMPT, content)
            .await?
            .context("extractor did not describe the content")?;
        Ok(Memory {
            start_line: 1,
            end_line: content.split('\n').count(),
            ..memory
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CoreResult;
    use parking_lot::Mutex;

    /// Replies with the queued turns, then plain text.
    struct Scripted(Mutex<Vec<Chat>>);

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, _messages: &[Chat], functions: &[FunctionSchema]) -> CoreResult<Chat> {
            assert_eq!(functions[0].name, ADD_MEMORY);
            let mut queue = self.0.lock();
            Ok(if queue.is_empty() {
                Chat::assistant("done")
            } else {
                queue.remove(0)
            })
        }
    }

    fn call(args: serde_json::Value) -> Chat {
        Chat::Assistant {
            content: String::new(),
            function_call: Some(crate::chat::FunctionCall {
                name: ADD_MEMORY.into(),
                arguments: args.to_string(),
            }),
        }
    }

    fn extractor(replies: Vec<Chat>) -> LlmExtractor {
        LlmExtractor::new(
            Arc::new(Scripted(Mutex::new(replies))),
            ExtractionConfig::default(),
        )
    }

    #[tokio::test]
    async fn extracts_until_model_stops() {
        let text = "alpha\nbeta\ngamma\ndelta\nepsilon\nzeta";
        let replies = vec![
            call(serde_json::json!({"start_line": 1, "end_line": 2, "title": "A"})),
            call(serde_json::json!({"start_line": 3, "end_line": 3, "title": "C"})),
            // Discarded, and no page produced a memory: the session ends.
            call(serde_json::json!({"start_line": 9, "end_line": 12, "title": "bad range"})),
            call(serde_json::json!({"start_line": 4, "end_line": 4, "title": "never asked"})),
        ];
        let memories = extractor(replies).extract(text, &[]).await.unwrap();
        let titles: Vec<&str> = memories.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn stops_when_too_little_is_visible() {
        let replies = vec![call(serde_json::json!({"start_line": 1, "end_line": 1, "title": "x"}))];
        let memories = extractor(replies).extract("one\ntwo", &[]).await.unwrap();
        assert!(memories.is_empty());
    }

    #[tokio::test]
    async fn describe_spans_whole_content() {
        let replies = vec![call(serde_json::json!({
            "start_line": 2, "end_line": 2, "title": "Greeting",
            "relevant_questions": ["who said hello?"]
        }))];
        let memory = extractor(replies).describe("hello\nworld\n!").await.unwrap();
        assert_eq!((memory.start_line, memory.end_line), (1, 3));
        assert_eq!(memory.title, "Greeting");
    }
}
