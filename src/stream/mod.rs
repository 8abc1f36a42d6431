//! Streaming of message content to observers.
//!
//! A [`StreamCollector`] owns the record of one message while it is being produced. Every
//! change is merged with [`merge::merge`] and republished through the
//! [`Registry`](crate::tree::Registry) as a [`StreamEvent`] keyed by the message id.

pub mod merge;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::Chat;
use crate::error::Result;
use crate::tree::{Path, Registry};
use merge::{merge_into, MergeMode};

/// An event delivered to observers of a message or conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Full state of a message (or conversation header). Sent by `prepare` without `chat`.
    Set {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<Path>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    /// An incremental delta to merge in `add` mode.
    Chunk { id: String, diff: Value },
    /// A nested conversation was opened below message `id`.
    Stack { id: String, stack: Path },
}

impl StreamEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Set { id, .. } | Self::Chunk { id, .. } | Self::Stack { id, .. } => id,
        }
    }

    /// Path embedded in the event, if any. Chunks and stack events are routed by lookup.
    pub fn path(&self) -> Option<&[String]> {
        match self {
            Self::Set { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

/// Accumulates one message record and publishes every change.
pub struct StreamCollector {
    registry: Arc<Registry>,
    path: Path,
    current_message: Value,
    meta: Value,
    ignore_keys: HashSet<String>,
    active: bool,
}

impl StreamCollector {
    /// Keys already holding a non-empty value are fixed and stripped from later chunks.
    pub(crate) fn new(registry: Arc<Registry>, path: Path, current_message: Value, meta: Value) -> Self {
        let ignore_keys = match &current_message {
            Value::Object(fields) => fields
                .iter()
                .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
                .map(|(k, _)| k.clone())
                .collect(),
            _ => HashSet::new(),
        };
        Self {
            registry,
            path,
            current_message,
            meta,
            ignore_keys,
            active: true,
        }
    }

    pub fn id(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn current_message(&self) -> &Value {
        &self.current_message
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    /// The accumulated record as a typed chat turn.
    pub fn chat(&self) -> Result<Chat> {
        Ok(serde_json::from_value(self.current_message.clone())?)
    }

    /// Tell observers where this stream's output belongs.
    pub(crate) async fn prepare(&self) -> Result<()> {
        let event = StreamEvent::Set {
            id: self.id().to_string(),
            path: Some(self.path.clone()),
            chat: None,
            meta: Some(self.meta.clone()),
        };
        self.registry.on_message(&event).await
    }

    /// Merge `diff` in add mode and publish it. A bare string is a `content` delta.
    pub async fn chunk(&mut self, diff: impl Into<Value>) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let diff = match diff.into() {
            Value::String(text) => serde_json::json!({ "content": text }),
            Value::Object(mut fields) => {
                fields.retain(|key, _| !self.ignore_keys.contains(key));
                if fields.is_empty() {
                    return Ok(());
                }
                Value::Object(fields)
            }
            other => other,
        };
        merge_into(MergeMode::Add, &mut self.current_message, diff.clone());
        let event = StreamEvent::Chunk {
            id: self.id().to_string(),
            diff,
        };
        self.registry.on_message(&event).await
    }

    /// Merge `chat` and `meta` in set mode and publish the full record. With both `None` this
    /// just flushes the current state.
    pub async fn set(&mut self, chat: Option<Value>, meta: Option<Value>) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        if let Some(chat) = chat {
            let chat = match chat {
                Value::String(text) => serde_json::json!({ "content": text }),
                other => other,
            };
            merge_into(MergeMode::Set, &mut self.current_message, chat);
        }
        if let Some(meta) = meta {
            merge_into(MergeMode::Set, &mut self.meta, meta);
        }
        let event = StreamEvent::Set {
            id: self.id().to_string(),
            path: Some(self.path.clone()),
            chat: Some(self.current_message.clone()),
            meta: Some(self.meta.clone()),
        };
        self.registry.on_message(&event).await
    }

    /// Overwrite the record with a complete chat turn.
    pub async fn set_chat(&mut self, chat: &Chat) -> Result<()> {
        let value = serde_json::to_value(chat)?;
        self.set(Some(value), None).await
    }

    /// Stop accepting updates; persistence owns the record from here on.
    pub fn off(&mut self) {
        self.active = false;
    }

    pub(crate) fn into_parts(self) -> (Value, Value) {
        (self.current_message, self.meta)
    }
}
