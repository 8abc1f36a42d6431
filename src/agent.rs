//! The agent loop: fit context, stream a completion, run the requested tool, repeat.

use std::sync::Arc;

use crate::chat::{Chat, FunctionSchema};
use crate::context::ContextFitter;
use crate::error::{Error, Result};
use crate::provider::CompletionService;
use crate::tools::Tool;
use crate::tree::{Conversation, MessageMeta, MessageRecord};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Parts of this \
conversation and related documents are stored in memory; call find_memory to recall details \
that are no longer visible.";

const DEFAULT_MAX_STEPS: usize = 16;

pub struct Agent {
    service: Arc<dyn CompletionService>,
    fitter: ContextFitter,
    tools: Vec<Arc<dyn Tool>>,
    system_prompt: String,
    max_steps: usize,
}

impl Agent {
    pub fn new(service: Arc<dyn CompletionService>, fitter: ContextFitter) -> Self {
        Self {
            service,
            fitter,
            tools: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    fn schemas(&self) -> Vec<FunctionSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.schema().name == name)
    }

    /// Append `task` as a user turn and run until the model answers without calling a
    /// function. Returns the final assistant message.
    ///
    /// A fresh conversation is seeded with the system prompt as an initial message.
    pub async fn run(&self, conversation: &Conversation, task: &str) -> Result<MessageRecord> {
        let registry = conversation.registry();
        if conversation.messages()?.is_empty() {
            conversation
                .send(Chat::system(&self.system_prompt), MessageMeta::initial())
                .await?;
        }
        conversation
            .send(Chat::user(task), MessageMeta::default())
            .await?;
        let schemas = self.schemas();

        for step in 0..self.max_steps {
            let chats = self.fitter.fit(conversation).await?;
            registry.checkpoint(conversation.path())?;

            let message = conversation.to(Chat::assistant(""), MessageMeta::default())?;
            let mut writer = message.write().await?;
            let streamed = self.service.stream(&chats, &schemas, &mut *writer).await;
            let record = writer.finish().await?;
            streamed?;
            registry.checkpoint(conversation.path())?;

            let Some(call) = record.chat.function_call().cloned() else {
                tracing::info!(conversation = %conversation.id(), steps = step + 1, "agent finished");
                return Ok(record);
            };
            message.update_meta(|meta| meta.action = Some(call.name.clone()))?;

            let content = match self.tool(&call.name) {
                Some(tool) => match tool.call(conversation, &call.arguments).await {
                    Ok(content) => content,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        tracing::warn!(tool = %call.name, error = %err, "tool failed");
                        format!("Error: {err}")
                    }
                },
                None => {
                    tracing::warn!(tool = %call.name, "model called an unknown function");
                    format!("Unknown function: {}", call.name)
                }
            };
            registry.checkpoint(conversation.path())?;
            let meta = MessageMeta {
                action: Some(call.name.clone()),
                ..MessageMeta::default()
            };
            conversation
                .send(Chat::function(call.name, content), meta)
                .await?;
        }

        tracing::warn!(conversation = %conversation.id(), steps = self.max_steps, "agent step limit reached");
        Err(Error::StepLimit(self.max_steps))
    }
}
