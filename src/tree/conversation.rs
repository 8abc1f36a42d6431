//! Conversations: ordered, forkable sequences of messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::Chat;
use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::stream::StreamEvent;
use crate::tree::message::{Message, MessageMeta, MessageRecord};
use crate::tree::{short_id, Path, Registry, ROOT};

/// Token budget used when a conversation is created without an explicit one.
pub const DEFAULT_CONTEXT_SIZE: usize = 8192;

/// Metadata of a conversation: creation time, soft-delete flag and free-form tags
/// (e.g. the name of the agent driving it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub tags: Map<String, Value>,
}

impl Default for ConversationMeta {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            deleted: false,
            tags: Map::new(),
        }
    }
}

impl ConversationMeta {
    pub fn tagged(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut meta = Self::default();
        meta.tags.insert(key.into(), value.into());
        meta
    }
}

fn default_context_size() -> usize {
    DEFAULT_CONTEXT_SIZE
}

/// The persisted state of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub meta: ConversationMeta,
    pub path: Path,
    /// Ids of the messages this conversation owns, in order.
    #[serde(default)]
    pub message_ids: Vec<String>,
    /// Source conversation path plus the branch message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<Path>,
    /// When set, new messages are spliced in right after this message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_after: Option<String>,
    #[serde(default = "default_context_size")]
    pub context_size: usize,
}

impl ConversationRecord {
    pub fn id(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// `(source conversation id, branch message id)` for forked conversations.
    pub fn fork_point(&self) -> Option<(&str, &str)> {
        let fork = self.forked_from.as_ref()?;
        match fork.as_slice() {
            [.., source, message] => Some((source.as_str(), message.as_str())),
            _ => None,
        }
    }
}

/// Handle to a conversation stored in the [`Registry`], optionally carrying the memory store
/// used to file away its history.
#[derive(Clone)]
pub struct Conversation {
    id: String,
    path: Path,
    registry: Arc<Registry>,
    memory: Option<Arc<MemoryStore>>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("path", &self.path)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl Conversation {
    /// Start a new top-level conversation.
    pub fn create(registry: &Arc<Registry>, meta: ConversationMeta) -> Result<Self> {
        Self::create_at(registry, vec![ROOT.to_string()], meta, None)
    }

    pub(crate) fn create_at(
        registry: &Arc<Registry>,
        parent: Path,
        meta: ConversationMeta,
        forked_from: Option<Path>,
    ) -> Result<Self> {
        let id = short_id();
        let mut path = parent;
        path.push(id.clone());
        let record = ConversationRecord {
            meta,
            path: path.clone(),
            message_ids: Vec::new(),
            forked_from,
            insert_after: None,
            context_size: DEFAULT_CONTEXT_SIZE,
        };
        registry.insert_conversation(record.clone());
        registry.save_conversation(&record)?;
        tracing::debug!(conversation = %id, path = ?path, "conversation created");
        Ok(Self {
            id,
            path,
            registry: Arc::clone(registry),
            memory: None,
        })
    }

    /// Look up an existing conversation.
    pub fn open(registry: &Arc<Registry>, id: &str) -> Result<Self> {
        let record = registry
            .conversation(id)
            .ok_or_else(|| Error::not_found("conversation", id))?;
        Ok(Self {
            id: id.to_string(),
            path: record.path,
            registry: Arc::clone(registry),
            memory: None,
        })
    }

    /// Attach the memory store that context fitting files old history into.
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn record(&self) -> Result<ConversationRecord> {
        self.registry
            .conversation(&self.id)
            .ok_or_else(|| Error::not_found("conversation", &self.id))
    }

    pub fn context_size(&self) -> Result<usize> {
        Ok(self.record()?.context_size)
    }

    pub fn set_context_size(&self, context_size: usize) -> Result<()> {
        self.update(|record| record.context_size = context_size)
            .map(|_| ())
    }

    /// Splice subsequent messages after `message_id` (or append again with `None`).
    pub fn set_insert_after(&self, message_id: Option<String>) -> Result<()> {
        self.update(|record| record.insert_after = message_id)
            .map(|_| ())
    }

    /// Merge `tags` into the metadata, persist, and notify observers.
    pub async fn set_meta(&self, tags: Map<String, Value>) -> Result<()> {
        self.update(|record| record.meta.tags.extend(tags))?;
        self.announce().await
    }

    /// Tell observers about this conversation's location and metadata.
    pub async fn announce(&self) -> Result<()> {
        let record = self.record()?;
        let event = StreamEvent::Set {
            id: self.id.clone(),
            path: Some(record.path),
            chat: None,
            meta: Some(serde_json::to_value(&record.meta)?),
        };
        self.registry.on_message(&event).await
    }

    pub fn delete(&self) -> Result<()> {
        self.update(|record| record.meta.deleted = true)?;
        tracing::debug!(conversation = %self.id, "conversation deleted");
        Ok(())
    }

    /// Create a new message owned by this conversation. The message is empty-streamed until
    /// written through [`Message::write`].
    pub fn to(&self, chat: Chat, meta: MessageMeta) -> Result<Message> {
        let id = short_id();
        let mut path = self.path.clone();
        path.push(id.clone());
        let record = MessageRecord { chat, meta, path };
        self.registry.insert_message(record.clone());

        let conversation = self.update(|conversation| {
            let position = match conversation.insert_after.as_deref() {
                Some(after) => match conversation.message_ids.iter().position(|m| m == after) {
                    Some(index) => index + 1,
                    // The cursor may point at the branch message of a fork.
                    None if conversation.fork_point().map(|(_, m)| m) == Some(after) => 0,
                    None => conversation.message_ids.len(),
                },
                None => conversation.message_ids.len(),
            };
            conversation.message_ids.insert(position, id.clone());
            if conversation.insert_after.is_some() {
                conversation.insert_after = Some(id.clone());
            }
        })?;
        self.registry.save_message(&record)?;
        tracing::trace!(
            conversation = %self.id,
            message = %id,
            count = conversation.message_ids.len(),
            "message added"
        );
        Ok(Message::from_id(Arc::clone(&self.registry), id))
    }

    /// Append a complete message without streaming.
    pub async fn send(&self, chat: Chat, meta: MessageMeta) -> Result<MessageRecord> {
        let message = self.to(chat.clone(), meta)?;
        let mut writer = message.write().await?;
        writer.set_chat(&chat).await?;
        writer.finish().await
    }

    /// Branch this conversation at `message_id`. The fork sees the history up to and including
    /// that message, then continues with its own messages.
    pub fn fork(&self, message_id: &str) -> Result<Conversation> {
        let record = self.record()?;
        let in_history = self
            .registry
            .effective_messages(&self.id)?
            .iter()
            .any(|m| m.id() == message_id);
        if !in_history {
            return Err(Error::not_found("message", message_id));
        }

        let mut forked_from = self.path.clone();
        forked_from.push(message_id.to_string());
        let meta = ConversationMeta {
            tags: record.meta.tags.clone(),
            ..ConversationMeta::default()
        };
        let fork =
            Self::create_at(&self.registry, forked_from.clone(), meta, Some(forked_from))?;
        fork.set_context_size(record.context_size)?;
        tracing::info!(from = %self.id, at = %message_id, fork = %fork.id, "conversation forked");
        Ok(Conversation {
            memory: self.memory.clone(),
            ..fork
        })
    }

    /// The effective history: imported fork prefix followed by live owned messages.
    pub fn messages(&self) -> Result<Vec<MessageRecord>> {
        self.registry.effective_messages(&self.id)
    }

    /// Handle to a message in this conversation's effective history.
    pub fn message(&self, id: &str) -> Result<Message> {
        if !self.messages()?.iter().any(|m| m.id() == id) {
            return Err(Error::not_found("message", id));
        }
        Ok(Message::from_id(Arc::clone(&self.registry), id.to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut ConversationRecord)) -> Result<ConversationRecord> {
        let record = self.registry.update_conversation(&self.id, f)?;
        self.registry.save_conversation(&record)?;
        Ok(record)
    }
}
