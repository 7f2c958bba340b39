//! Error types for per-chat interpreter sessions

use super::ChatId;

/// Failures of a single chat session.
///
/// None of these are fatal to the bot as a whole: a spawn failure is reported
/// to the chat, and I/O failures close the session so the next message can
/// start a fresh one.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn interpreter `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("interpreter stdin is closed: {0}")]
    Write(#[source] std::io::Error),
    #[error("interpreter output read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("session for chat {0} is closing")]
    Closing(ChatId),
    #[error("failed to terminate interpreter (pid {pid:?}): {source}")]
    Terminate {
        pid: Option<u32>,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Whether the error means the session can no longer be used and the
    /// caller should retry against a fresh one.
    pub fn is_session_unusable(&self) -> bool {
        matches!(self, SessionError::Write(_) | SessionError::Closing(_))
    }
}
