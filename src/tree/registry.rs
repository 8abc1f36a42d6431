//! Process-wide index of the conversation tree.
//!
//! The [`Registry`] is constructed once at startup, loads every persisted record, and is then
//! shared as `Arc<Registry>` with every conversation and message handle. Besides the arena of
//! records it routes stream events to subscribed consumers and tracks cancelled ids.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{ConsumerError, Error, Result};
use crate::stream::StreamEvent;
use crate::tree::conversation::ConversationRecord;
use crate::tree::message::MessageRecord;
use crate::tree::persist::RecordStore;
use crate::tree::{Path, ROOT};

/// File name (without extension) of a conversation record inside its directory.
const CONVERSATION_RECORD: &str = "conversation";

/// Fork chains deeper than this are treated as corrupt.
const MAX_FORK_DEPTH: usize = 256;

/// An observer of stream events.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Deliver one event. Return [`ConsumerError::Closed`] to be unsubscribed.
    async fn consume(&self, event: &StreamEvent) -> Result<(), ConsumerError>;
}

/// Forwards events into an unbounded channel. Dropping the receiver closes the consumer.
pub struct ChannelConsumer {
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelConsumer {
    pub fn new(sender: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Consumer for ChannelConsumer {
    async fn consume(&self, event: &StreamEvent) -> Result<(), ConsumerError> {
        self.sender
            .send(event.clone())
            .map_err(|_| ConsumerError::Closed)
    }
}

pub type SubscriptionId = u64;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    consumer: Arc<dyn Consumer>,
}

/// Arena of messages and conversations plus fan-out and cancellation state.
pub struct Registry {
    store: Arc<dyn RecordStore>,
    messages: Mutex<HashMap<String, MessageRecord>>,
    conversations: Mutex<HashMap<String, ConversationRecord>>,
    consumers: Mutex<HashMap<String, Vec<Subscription>>>,
    cancelled: Mutex<HashSet<String>>,
    next_subscription: AtomicU64,
}

impl Registry {
    /// An empty registry writing to `store`.
    pub fn new(store: Arc<dyn RecordStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            messages: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// A registry populated from everything persisted in `store`.
    pub fn open(store: Arc<dyn RecordStore>) -> Result<Arc<Self>> {
        let registry = Self::new(store);
        registry.load()?;
        Ok(registry)
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ── Loading and saving ───────────────────────────────────────────────────

    /// Walk `root/` recursively and register every conversation and message found.
    /// Returns the number of conversations loaded.
    pub fn load(&self) -> Result<usize> {
        let root = vec![ROOT.to_string()];
        let mut loaded = 0;
        for id in self.store.list(&root)? {
            loaded += self.load_conversation(vec![ROOT.to_string(), id])?;
        }
        tracing::info!(
            conversations = loaded,
            messages = self.messages.lock().len(),
            "conversation tree loaded"
        );
        Ok(loaded)
    }

    fn load_conversation(&self, dir: Path) -> Result<usize> {
        let Some(value) = self.store.read(&dir, CONVERSATION_RECORD)? else {
            tracing::warn!(path = ?dir, "directory without conversation record, skipping");
            return Ok(0);
        };
        let record: ConversationRecord = serde_json::from_value(value)?;

        for message_id in &record.message_ids {
            match self.store.read(&dir, message_id)? {
                Some(value) => {
                    let message: MessageRecord = serde_json::from_value(value)?;
                    self.insert_message(message);
                }
                None => tracing::warn!(
                    conversation = %record.id(),
                    message = %message_id,
                    "message record missing"
                ),
            }
        }
        self.insert_conversation(record);

        // Children live below `<conversation>/<message id>/<child id>/`.
        let mut loaded = 1;
        for message_dir in self.store.list(&dir)? {
            let mut message_path = dir.clone();
            message_path.push(message_dir);
            for child in self.store.list(&message_path)? {
                let mut child_path = message_path.clone();
                child_path.push(child);
                loaded += self.load_conversation(child_path)?;
            }
        }
        Ok(loaded)
    }

    /// Persist a message record next to its conversation record.
    pub(crate) fn save_message(&self, record: &MessageRecord) -> Result<()> {
        let (name, dir) = record
            .path
            .split_last()
            .ok_or_else(|| Error::InvalidPath(String::new()))?;
        self.store.write(dir, name, &serde_json::to_value(record)?)
    }

    pub(crate) fn save_conversation(&self, record: &ConversationRecord) -> Result<()> {
        self.store
            .write(&record.path, CONVERSATION_RECORD, &serde_json::to_value(record)?)
    }

    // ── Arena ────────────────────────────────────────────────────────────────

    pub(crate) fn insert_message(&self, record: MessageRecord) {
        self.messages.lock().insert(record.id().to_string(), record);
    }

    pub(crate) fn insert_conversation(&self, record: ConversationRecord) {
        self.conversations
            .lock()
            .insert(record.id().to_string(), record);
    }

    pub(crate) fn update_message(
        &self,
        id: &str,
        f: impl FnOnce(&mut MessageRecord),
    ) -> Result<MessageRecord> {
        let mut messages = self.messages.lock();
        let record = messages
            .get_mut(id)
            .ok_or_else(|| Error::not_found("message", id))?;
        f(record);
        Ok(record.clone())
    }

    pub(crate) fn update_conversation(
        &self,
        id: &str,
        f: impl FnOnce(&mut ConversationRecord),
    ) -> Result<ConversationRecord> {
        let mut conversations = self.conversations.lock();
        let record = conversations
            .get_mut(id)
            .ok_or_else(|| Error::not_found("conversation", id))?;
        f(record);
        Ok(record.clone())
    }

    pub fn message(&self, id: &str) -> Option<MessageRecord> {
        self.messages.lock().get(id).cloned()
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationRecord> {
        self.conversations.lock().get(id).cloned()
    }

    /// All conversations, oldest first.
    pub fn conversations(&self) -> Vec<ConversationRecord> {
        let mut all: Vec<_> = self.conversations.lock().values().cloned().collect();
        all.sort_by_key(|c| c.meta.timestamp);
        all
    }

    /// Path of a message or conversation id.
    pub fn path_of(&self, id: &str) -> Option<Path> {
        if let Some(message) = self.messages.lock().get(id) {
            return Some(message.path.clone());
        }
        self.conversations.lock().get(id).map(|c| c.path.clone())
    }

    /// Ids of conversations whose parent segment is `id` (forks and nested conversations of
    /// a message, or top-level conversations for [`ROOT`]), oldest first.
    pub fn children_of(&self, id: &str) -> Vec<String> {
        let conversations = self.conversations.lock();
        let mut children: Vec<&ConversationRecord> = conversations
            .values()
            .filter(|c| c.path.len() >= 2 && c.path[c.path.len() - 2] == id)
            .collect();
        children.sort_by_key(|c| c.meta.timestamp);
        children.iter().map(|c| c.id().to_string()).collect()
    }

    /// The effective message list of a conversation: the fork prefix (if any) followed by
    /// its own messages, without soft-deleted ones.
    pub fn effective_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let conversations = self.conversations.lock();
        let messages = self.messages.lock();
        let all = collect_messages(conversation_id, &conversations, &messages, 0)?;
        Ok(all.into_iter().filter(|m| !m.meta.deleted).collect())
    }

    // ── Fan-out ──────────────────────────────────────────────────────────────

    /// Subscribe `consumer` to events of a message or conversation id.
    pub fn add_consumer(&self, id: &str, consumer: Arc<dyn Consumer>) -> SubscriptionId {
        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.consumers
            .lock()
            .entry(id.to_string())
            .or_default()
            .push(Subscription {
                id: subscription,
                consumer,
            });
        tracing::debug!(target_id = %id, subscription, "consumer added");
        subscription
    }

    /// Subscribe through a channel. Dropping the receiver unsubscribes on the next event.
    pub fn subscribe(
        &self,
        id: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.add_consumer(id, Arc::new(ChannelConsumer::new(sender)));
        (subscription, receiver)
    }

    pub fn unsubscribe(&self, id: &str, subscription: SubscriptionId) {
        let mut consumers = self.consumers.lock();
        if let Some(list) = consumers.get_mut(id) {
            list.retain(|s| s.id != subscription);
            if list.is_empty() {
                consumers.remove(id);
            }
        }
    }

    pub fn consumer_count(&self, id: &str) -> usize {
        self.consumers.lock().get(id).map_or(0, Vec::len)
    }

    /// Route an event to the consumers of its message id and of its conversation id.
    ///
    /// Fails only with [`Error::Cancelled`] when an id on the event's path was cancelled.
    /// Closed consumers are unsubscribed; other consumer errors are logged.
    pub async fn on_message(&self, event: &StreamEvent) -> Result<()> {
        let path = match event.path() {
            Some(path) => path.to_vec(),
            None => self
                .path_of(event.id())
                .unwrap_or_else(|| vec![event.id().to_string()]),
        };
        self.checkpoint(&path)?;

        let targets: Vec<(String, Subscription)> = {
            let consumers = self.consumers.lock();
            path.iter()
                .rev()
                .take(2)
                .flat_map(|id| {
                    consumers
                        .get(id)
                        .into_iter()
                        .flatten()
                        .map(move |s| (id.clone(), s.clone()))
                })
                .collect()
        };

        for (target, subscription) in targets {
            match subscription.consumer.consume(event).await {
                Ok(()) => {}
                Err(ConsumerError::Closed) => {
                    tracing::debug!(target_id = %target, subscription = subscription.id, "consumer closed");
                    self.unsubscribe(&target, subscription.id);
                }
                Err(ConsumerError::Other(err)) => {
                    tracing::warn!(target_id = %target, error = %err, "consumer failed, continuing");
                }
            }
        }
        Ok(())
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Mark `id` cancelled. The next checkpoint on a path containing it fails once.
    pub fn cancel(&self, id: &str) {
        self.cancelled.lock().insert(id.to_string());
        tracing::info!(id = %id, "cancellation requested");
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.lock().contains(id)
    }

    /// Cancellation checkpoint. Consumes the mark of the first cancelled id on `path`.
    pub fn checkpoint(&self, path: &[String]) -> Result<()> {
        let mut cancelled = self.cancelled.lock();
        if cancelled.is_empty() {
            return Ok(());
        }
        if let Some(id) = path.iter().find(|id| cancelled.contains(id.as_str())) {
            let id = id.clone();
            cancelled.remove(&id);
            tracing::info!(id = %id, "cancellation observed");
            return Err(Error::Cancelled(id));
        }
        Ok(())
    }
}

fn collect_messages(
    conversation_id: &str,
    conversations: &HashMap<String, ConversationRecord>,
    messages: &HashMap<String, MessageRecord>,
    depth: usize,
) -> Result<Vec<MessageRecord>> {
    if depth > MAX_FORK_DEPTH {
        return Err(Error::Other(anyhow::anyhow!(
            "fork chain of {conversation_id} exceeds {MAX_FORK_DEPTH} levels"
        )));
    }
    let conversation = conversations
        .get(conversation_id)
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;

    let mut out = Vec::new();
    if let Some((source, branch)) = conversation.fork_point() {
        let prefix = collect_messages(source, conversations, messages, depth + 1)?;
        match prefix.iter().position(|m| m.id() == branch) {
            Some(index) => out.extend(prefix.into_iter().take(index + 1)),
            None => {
                tracing::warn!(conversation = %conversation_id, branch = %branch, "branch message not in source history");
                out.extend(prefix);
            }
        }
    }
    out.extend(
        conversation
            .message_ids
            .iter()
            .filter_map(|id| messages.get(id).cloned()),
    );
    Ok(out)
}
