//! The conversation tree.
//!
//! Every node carries a `path`: the ids of its ancestors ending in its own id. The path is the
//! only ownership link. A message's conversation is `path[-2]`; a conversation forked or
//! nested at a message has that message id as its `path[-2]`. Children are derived by scanning
//! the [`Registry`], never stored.
//!
//! ```text
//! root
//! └── conversation a1b2c3d4
//!     ├── message 0f1e2d3c
//!     └── message 9a8b7c6d
//!         └── conversation (fork) 11223344
//! ```

pub mod conversation;
pub mod message;
pub mod persist;
pub mod registry;

pub use conversation::{Conversation, ConversationMeta, ConversationRecord};
pub use message::{Message, MessageMeta, MessageRecord, MessageWriter};
pub use persist::{FileStore, RecordStore};
pub use registry::{ChannelConsumer, Consumer, Registry, SubscriptionId};

/// Ancestor chain ending in a node's own id.
pub type Path = Vec<String>;

/// First segment of every top-level conversation path.
pub const ROOT: &str = "root";

/// Short opaque id: the first 8 hex digits of a random UUID.
pub(crate) fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
