//! The completion service boundary.
//!
//! The core treats the language model as a black box: given the fitted chat turns and the
//! available function schemas it returns one assistant turn. [`CompletionService::stream`]
//! delivers the same turn as deltas through a [`StreamCollector`].

pub mod openai;

use std::time::Duration;

use async_trait::async_trait;

use crate::chat::{Chat, FunctionSchema};
use crate::config::CompletionConfig;
use crate::error::{Error, Result};
use crate::stream::StreamCollector;

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// One assistant turn (content or a function call).
    async fn complete(&self, messages: &[Chat], functions: &[FunctionSchema]) -> Result<Chat>;

    /// Produce the turn into `stream`, returning the final turn.
    ///
    /// The default completes first and publishes the result as one `set`.
    async fn stream(
        &self,
        messages: &[Chat],
        functions: &[FunctionSchema],
        stream: &mut StreamCollector,
    ) -> Result<Chat> {
        let chat = self.complete(messages, functions).await?;
        stream.set_chat(&chat).await?;
        Ok(chat)
    }
}

/// A failed request to a remote service.
#[derive(Debug, thiserror::Error)]
#[error(
    "{service} request failed ({}): {message}",
    .status.map_or_else(|| "connection".to_string(), |s| s.to_string())
)]
pub struct ServiceError {
    pub service: &'static str,
    /// HTTP status, `None` for connection-level failures.
    pub status: Option<u16>,
    pub message: String,
}

impl ServiceError {
    /// Connection failures, rate limits and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 429 || status >= 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl From<&CompletionConfig> for RetryPolicy {
    fn from(config: &CompletionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `initial * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Other(inner) => inner
            .downcast_ref::<ServiceError>()
            .is_some_and(ServiceError::is_retryable),
        _ => false,
    }
}

/// [`CompletionService::complete`] retried on transient failures. Cancellation and other
/// errors are returned immediately.
pub async fn complete_with_retry(
    service: &dyn CompletionService,
    messages: &[Chat],
    functions: &[FunctionSchema],
    policy: &RetryPolicy,
) -> Result<Chat> {
    let mut attempt = 0;
    loop {
        match service.complete(messages, functions).await {
            Ok(chat) => return Ok(chat),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying completion"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
