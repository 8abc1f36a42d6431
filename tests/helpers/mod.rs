#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use arbor::chat::{Chat, FunctionCall, FunctionSchema};
use arbor::embedding::EmbeddingProvider;
use arbor::memory::extract::MemoryExtractor;
use arbor::memory::types::{Memory, MemoryWithMeta};
use arbor::memory::MemoryStore;
use arbor::provider::CompletionService;
use arbor::stream::StreamCollector;
use arbor::tree::{FileStore, Registry};

pub const DIMENSIONS: usize = 64;

/// A registry persisting into a fresh temporary directory.
pub fn test_registry() -> (TempDir, Arc<Registry>) {
    let tmp = TempDir::new().unwrap();
    let registry = Registry::new(Arc::new(FileStore::new(tmp.path())));
    (tmp, registry)
}

/// A second registry loaded from what `tmp` holds on disk.
pub fn reopen(tmp: &TempDir) -> Arc<Registry> {
    Registry::open(Arc::new(FileStore::new(tmp.path()))).unwrap()
}

/// Bag-of-words embedding: each lowercase word adds weight to a bucket chosen by its hash.
/// Texts sharing words are close, unrelated texts are nearly orthogonal.
pub struct BagOfWords;

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMENSIONS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        let digest = Sha256::digest(word.to_lowercase().as_bytes());
        v[digest[0] as usize % DIMENSIONS] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(bag_of_words(text))
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }
}

/// Deterministic extractor: one fragment per blank-line separated paragraph, titled by
/// its first line.
pub struct ParagraphExtractor;

#[async_trait]
impl MemoryExtractor for ParagraphExtractor {
    async fn extract(&self, content: &str, existing: &[MemoryWithMeta]) -> anyhow::Result<Vec<Memory>> {
        let lines: Vec<&str> = content.split('\n').collect();
        let mut found = Vec::new();
        let mut start: Option<usize> = None;
        for (i, line) in lines.iter().enumerate() {
            let number = i + 1;
            match (line.trim().is_empty(), start) {
                (false, None) => start = Some(number),
                (true, Some(first)) => {
                    found.push((first, number - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(first) = start {
            found.push((first, lines.len()));
        }

        Ok(found
            .into_iter()
            .filter(|(s, e)| {
                !existing
                    .iter()
                    .any(|m| m.memory.start_line <= *e && m.memory.end_line >= *s)
            })
            .map(|(start_line, end_line)| paragraph_memory(&lines, start_line, end_line))
            .collect())
    }

    async fn describe(&self, content: &str) -> anyhow::Result<Memory> {
        let lines: Vec<&str> = content.split('\n').collect();
        Ok(paragraph_memory(&lines, 1, lines.len()))
    }
}

fn paragraph_memory(lines: &[&str], start_line: usize, end_line: usize) -> Memory {
    let title: String = lines[start_line - 1].trim().chars().take(60).collect();
    Memory {
        start_line,
        end_line,
        title: title.clone(),
        relevant_questions: vec![format!("what about {title}?")],
        tags: vec![],
        context: None,
        symbol_id: None,
    }
}

/// In-memory store with deterministic services.
pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::in_memory(Arc::new(BagOfWords), Arc::new(ParagraphExtractor)).unwrap())
}

/// Completion service replying with queued turns (then a fixed answer), recording every
/// request. Streaming delivers the reply as several `chunk` deltas.
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Chat>>,
    pub requests: Mutex<Vec<Vec<Chat>>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Chat>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

pub const FINAL_ANSWER: &str = "That is all.";

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, messages: &[Chat], _functions: &[FunctionSchema]) -> arbor::Result<Chat> {
        self.requests.lock().push(messages.to_vec());
        Ok(self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Chat::assistant(FINAL_ANSWER)))
    }

    async fn stream(
        &self,
        messages: &[Chat],
        functions: &[FunctionSchema],
        stream: &mut StreamCollector,
    ) -> arbor::Result<Chat> {
        let reply = self.complete(messages, functions).await?;
        let content = reply.content().to_string();
        let mut rest = content.as_str();
        while !rest.is_empty() {
            let cut = rest
                .char_indices()
                .nth(4)
                .map_or(rest.len(), |(i, _)| i);
            stream.chunk(json!({ "content": &rest[..cut] })).await?;
            rest = &rest[cut..];
        }
        if let Some(call) = reply.function_call() {
            stream
                .chunk(json!({"function_call": {"name": call.name, "arguments": ""}}))
                .await?;
            let half = call.arguments.len() / 2;
            let split = (half..=call.arguments.len())
                .find(|i| call.arguments.is_char_boundary(*i))
                .unwrap_or(call.arguments.len());
            stream
                .chunk(json!({"function_call": {"arguments": &call.arguments[..split]}}))
                .await?;
            stream
                .chunk(json!({"function_call": {"arguments": &call.arguments[split..]}}))
                .await?;
        }
        stream.chat()
    }
}

/// An assistant turn calling `name` with `arguments`.
pub fn call(name: &str, arguments: serde_json::Value) -> Chat {
    Chat::Assistant {
        content: String::new(),
        function_call: Some(FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        }),
    }
}
