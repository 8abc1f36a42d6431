//! Error taxonomy for the conversation tree.
//!
//! [`Error`] covers everything the core can surface to a producer. Observer failures never
//! appear here: a closed consumer is a [`ConsumerError::Closed`] that the registry handles by
//! dropping the subscription.

use std::path::PathBuf;

/// Errors raised by the conversation tree, streaming and context fitting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The conversation (or any ancestor in the emitting path) was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A path component that cannot be used as a directory name.
    #[error("invalid path component: {0:?}")]
    InvalidPath(String),

    /// Writing or reading a persisted record failed. Never swallowed.
    #[error("persistence failed at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The agent loop ran out of steps without producing a final answer.
    #[error("no final answer after {0} steps")]
    StepLimit(usize),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Recovers a wrapped [`Error`] (most importantly [`Error::Cancelled`]) from an
/// `anyhow::Error` produced by a service or tool implementation.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(other) => Self::Other(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Signal returned by an observer during delivery.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The observer can no longer receive events and should be unsubscribed.
    #[error("consumer closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
