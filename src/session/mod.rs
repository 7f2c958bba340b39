//! Per-chat interpreter sessions
//!
//! This module provides the session concurrency core: the process adapter,
//! the output buffer and its flusher, the chat session lifecycle, the
//! registry that maps chats to sessions, and the inactivity reaper.

pub mod buffer;
pub mod chat_session;
pub mod error;
pub mod flusher;
pub mod process;
pub mod reaper;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

pub use crate::transport::ChatId;
pub use buffer::OutputBuffer;
pub use chat_session::{ActivityClock, ChatSession, SessionState, SessionStatus};
pub use error::SessionError;
pub use flusher::{Flusher, split_message};
pub use process::ProcessAdapter;
pub use reaper::Reaper;
pub use registry::SessionRegistry;

use crate::config::{Config, InterpreterConfig};
use crate::metrics::BotMetrics;
use crate::transport::{ChatTransport, RetryPolicy};

/// Everything a new session needs besides its chat id
#[derive(Clone)]
pub struct SessionContext {
    pub interpreter: InterpreterConfig,
    pub flush_interval: Duration,
    pub max_message_chars: usize,
    pub terminate_grace: Duration,
    pub close_wait: Duration,
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
    pub transport: Arc<dyn ChatTransport>,
    pub metrics: Arc<BotMetrics>,
}

impl SessionContext {
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn ChatTransport>,
        metrics: Arc<BotMetrics>,
    ) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            flush_interval: Duration::from_millis(config.session.flush_interval_ms),
            max_message_chars: config.telegram.max_message_chars,
            terminate_grace: Duration::from_millis(config.session.terminate_grace_ms),
            close_wait: Duration::from_millis(config.session.close_wait_ms),
            write_timeout: Duration::from_millis(config.session.write_timeout_ms),
            retry: RetryPolicy::from_config(&config.telegram),
            transport,
            metrics,
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("interpreter", &self.interpreter.program)
            .field("flush_interval", &self.flush_interval)
            .field("max_message_chars", &self.max_message_chars)
            .field("terminate_grace", &self.terminate_grace)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}
