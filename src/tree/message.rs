//! Messages: single chat turns with persisted metadata.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::Chat;
use crate::error::{Error, Result};
use crate::stream::StreamCollector;
use crate::tokens;
use crate::tree::conversation::Conversation;
use crate::tree::{ConversationMeta, Path, Registry};

/// Metadata stored next to a message's chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub timestamp: DateTime<Utc>,
    /// Seconds between creation and the end of the first write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(default)]
    pub deleted: bool,
    /// Initial messages (system prompt, seeded context) are never summarized or dropped.
    #[serde(default)]
    pub is_initial: bool,
    /// Control messages carry no conversational content.
    #[serde(default)]
    pub control: bool,
    /// Action this message represents, if not implied by its chat turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Ids of memory fragments derived from this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memories: Vec<String>,
    /// One-line outline used once the message is cut from the fitted history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<String>,
    /// Substitute turn used while the message is still inside the fitted history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_summary: Option<Chat>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            duration: None,
            tokens: None,
            deleted: false,
            is_initial: false,
            control: false,
            action: None,
            memories: Vec::new(),
            outline: None,
            chat_summary: None,
            extra: Map::new(),
        }
    }
}

impl MessageMeta {
    pub fn initial() -> Self {
        Self {
            is_initial: true,
            ..Self::default()
        }
    }
}

/// The persisted state of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub chat: Chat,
    pub meta: MessageMeta,
    pub path: Path,
}

impl MessageRecord {
    pub fn id(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Id of the owning conversation (`path[-2]`).
    pub fn conversation_id(&self) -> Option<&str> {
        self.path.iter().rev().nth(1).map(String::as_str)
    }

    pub fn tokens(&self) -> usize {
        self.meta
            .tokens
            .unwrap_or_else(|| tokens::count_chat(&self.chat))
    }

    /// The action behind this message: explicit meta first, then the chat turn.
    pub fn action(&self) -> Option<&str> {
        self.meta.action.as_deref().or_else(|| self.chat.action())
    }

    /// The turn to submit while this message is kept in the fitted history.
    pub fn summary_or_chat(&self) -> &Chat {
        self.meta.chat_summary.as_ref().unwrap_or(&self.chat)
    }
}

/// Handle to a message stored in the [`Registry`].
#[derive(Clone)]
pub struct Message {
    id: String,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").field("id", &self.id).finish()
    }
}

impl Message {
    pub(crate) fn from_id(registry: Arc<Registry>, id: String) -> Self {
        Self { id, registry }
    }

    /// Look up an existing message.
    pub fn open(registry: &Arc<Registry>, id: &str) -> Result<Self> {
        if registry.message(id).is_none() {
            return Err(Error::not_found("message", id));
        }
        Ok(Self::from_id(Arc::clone(registry), id.to_string()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Current snapshot of the record.
    pub fn record(&self) -> Result<MessageRecord> {
        self.registry
            .message(&self.id)
            .ok_or_else(|| Error::not_found("message", &self.id))
    }

    pub fn chat(&self) -> Result<Chat> {
        Ok(self.record()?.chat)
    }

    /// Ids of conversations forked or nested at this message, computed on every call.
    pub fn children(&self) -> Vec<String> {
        self.registry.children_of(&self.id)
    }

    /// Start writing: returns a prepared stream bound to this message's chat, meta and path.
    ///
    /// If preparing fails (typically cancellation) on a message that was never written, the
    /// message is soft-deleted so no empty turn is left in the history.
    pub async fn write(&self) -> Result<MessageWriter> {
        let record = self.record()?;
        let never_written = record.meta.duration.is_none();
        let stream = StreamCollector::new(
            Arc::clone(&self.registry),
            record.path,
            serde_json::to_value(&record.chat)?,
            serde_json::to_value(&record.meta)?,
        );
        if let Err(err) = stream.prepare().await {
            if never_written {
                self.delete()?;
            }
            return Err(err);
        }
        Ok(MessageWriter {
            message: self.clone(),
            stream,
        })
    }

    /// Apply `update` to the metadata and persist.
    pub fn update_meta(&self, update: impl FnOnce(&mut MessageMeta)) -> Result<MessageRecord> {
        let record = self.registry.update_message(&self.id, |record| update(&mut record.meta))?;
        self.registry.save_message(&record)?;
        Ok(record)
    }

    /// Soft delete. The record stays on disk with `deleted` set.
    pub fn delete(&self) -> Result<()> {
        self.update_meta(|meta| meta.deleted = true)?;
        tracing::debug!(message = %self.id, "message deleted");
        Ok(())
    }

    /// Open a nested conversation below this message (e.g. a sub-agent run by a tool).
    pub async fn conversation(&self, meta: ConversationMeta) -> Result<Conversation> {
        let record = self.record()?;
        let conversation = Conversation::create_at(&self.registry, record.path, meta, None)?;
        let event = crate::stream::StreamEvent::Stack {
            id: self.id.clone(),
            stack: conversation.path().to_vec(),
        };
        self.registry.on_message(&event).await?;
        Ok(conversation)
    }
}

/// Open write scope of a message. Dereferences to its [`StreamCollector`].
///
/// Call [`MessageWriter::finish`] to close the scope: the record is written back and
/// persisted, and later chunks are ignored.
pub struct MessageWriter {
    message: Message,
    stream: StreamCollector,
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter").finish_non_exhaustive()
    }
}

impl std::ops::Deref for MessageWriter {
    type Target = StreamCollector;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}

impl std::ops::DerefMut for MessageWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.stream
    }
}

impl MessageWriter {
    /// Close the write scope and persist the final state.
    pub async fn finish(mut self) -> Result<MessageRecord> {
        self.stream.off();
        let path = self.stream.path().to_vec();
        let (chat, meta) = self.stream.into_parts();
        let chat: Chat = serde_json::from_value(chat)?;
        let mut meta: MessageMeta = serde_json::from_value(meta)?;

        if meta.duration.is_none() {
            let elapsed = Utc::now() - meta.timestamp;
            meta.duration = Some(elapsed.num_milliseconds() as f64 / 1000.0);
        }
        meta.tokens = Some(tokens::count_chat(&chat));

        let record = self.message.registry.update_message(&self.message.id, |record| {
            record.chat = chat;
            record.meta = meta;
        })?;
        self.message.registry.save_message(&record)?;
        tracing::debug!(
            message = %self.message.id,
            tokens = record.meta.tokens.unwrap_or_default(),
            "message persisted"
        );
        self.message.registry.checkpoint(&path)?;
        Ok(record)
    }
}
