//! Chat transport abstraction
//!
//! The session core only needs two things from the chat service: a batch of
//! inbound messages after a cursor, and a way to send text to a chat.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::TelegramConfig;

pub use mock::MockTransport;

/// Chat identifier assigned by the chat service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChatId {
    fn from(value: i64) -> Self {
        ChatId(value)
    }
}

/// One inbound update. `text` is `None` for updates that carry no text
/// message; they still advance the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub chat_id: ChatId,
    pub text: Option<String>,
}

impl InboundMessage {
    pub fn text(update_id: i64, chat_id: impl Into<ChatId>, text: impl Into<String>) -> Self {
        Self {
            update_id,
            chat_id: chat_id.into(),
            text: Some(text.into()),
        }
    }
}

/// Error types for chat service operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request error: {0}")]
    Http(String),
    #[error("HTTP status error: {0} - {1}")]
    Status(u16, String),
    #[error("chat service rejected the request: {0}")]
    Api(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(_) => true,
            TransportError::Status(code, _) => *code == 429 || *code >= 500,
            TransportError::Api(_) | TransportError::Decode(_) => false,
        }
    }
}

/// The chat service as seen by the dispatcher and the flushers
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Fetch the next batch of updates at or after `cursor`. May block for a
    /// bounded server-side poll interval.
    async fn fetch_updates(&self, cursor: Option<i64>)
    -> Result<Vec<InboundMessage>, TransportError>;

    /// Deliver `text` to `chat`
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<(), TransportError>;
}

/// Exponential backoff settings for transport calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// `None` retries forever
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &TelegramConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.retry_initial_interval_ms),
            max_interval: Duration::from_millis(config.retry_max_interval_ms),
            max_elapsed: Some(Duration::from_secs(config.send_max_elapsed_secs)),
        }
    }

    pub fn forever(mut self) -> Self {
        self.max_elapsed = None;
        self
    }

    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(self.max_elapsed)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed: Some(Duration::from_secs(120)),
        }
    }
}

/// Send `text`, retrying transient failures according to `policy`
pub async fn send_with_retry(
    transport: &dyn ChatTransport,
    chat: ChatId,
    text: &str,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    backoff::future::retry_notify(
        policy.backoff(),
        move || async move {
            transport.send_message(chat, text).await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        },
        |e: TransportError, wait: Duration| {
            warn!("Send to chat {} failed ({}), retrying in {:?}", chat, e, wait);
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            max_elapsed: Some(Duration::from_secs(2)),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Http("timeout".into()).is_transient());
        assert!(TransportError::Status(502, String::new()).is_transient());
        assert!(TransportError::Status(429, String::new()).is_transient());
        assert!(!TransportError::Status(403, String::new()).is_transient());
        assert!(!TransportError::Api("chat not found".into()).is_transient());
    }

    #[tokio::test]
    async fn test_send_with_retry_recovers_from_transient_failures() {
        let transport = MockTransport::new();
        transport.fail_next_sends(2, || TransportError::Http("connection reset".into()));

        assert_ok!(send_with_retry(&transport, ChatId(1), "hello", &fast_policy()).await);
        assert_eq!(transport.sent_to(ChatId(1)), vec!["hello".to_string()]);
        assert_eq!(transport.send_attempts(), 3);
    }

    #[tokio::test]
    async fn test_send_with_retry_stops_on_permanent_failure() {
        let transport = MockTransport::new();
        transport.fail_next_sends(1, || TransportError::Api("bot was blocked".into()));

        assert_err!(send_with_retry(&transport, ChatId(1), "hello", &fast_policy()).await);
        assert!(transport.sent().is_empty());
        assert_eq!(transport.send_attempts(), 1);
    }
}
