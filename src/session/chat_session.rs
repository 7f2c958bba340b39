//! One chat's interpreter session and its lifecycle

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::buffer::OutputBuffer;
use super::error::SessionError;
use super::flusher::Flusher;
use super::process::{OutputChunks, ProcessAdapter};
use super::{ChatId, SessionContext};

/// Session lifecycle. Transitions only move forward:
/// `Active -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::Active => 0,
            SessionState::Closing => 1,
            SessionState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Last-activity timestamp shared by the dispatcher, reader and flusher
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Acquire))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last())
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a session for status replies
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub chat_id: ChatId,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub alive: bool,
    pub started_at: DateTime<Utc>,
    pub idle: Duration,
    pub pending_bytes: usize,
}

struct SessionWorkers {
    reader: JoinHandle<()>,
    flusher: JoinHandle<()>,
}

/// A chat's interpreter process, its pending output, and the two tasks that
/// move output from the process to the chat.
pub struct ChatSession {
    id: ChatId,
    state: AtomicU8,
    started_at: DateTime<Utc>,
    process: ProcessAdapter,
    buffer: Arc<OutputBuffer>,
    activity: Arc<ActivityClock>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Option<SessionWorkers>>,
    close_wait: Duration,
}

impl ChatSession {
    /// Take ownership of a started process and spawn the reader and flusher
    /// tasks for it.
    pub fn launch(id: ChatId, process: ProcessAdapter, ctx: &SessionContext) -> Arc<Self> {
        let buffer = Arc::new(OutputBuffer::new());
        let activity = Arc::new(ActivityClock::new());
        activity.touch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = match process.take_output() {
            Some(output) => tokio::spawn(read_output(
                id,
                output,
                buffer.clone(),
                activity.clone(),
            )),
            None => tokio::spawn(async {}),
        };

        let flusher = Flusher::new(
            id,
            buffer.clone(),
            activity.clone(),
            ctx.transport.clone(),
            ctx.metrics.clone(),
        )
        .with_interval(ctx.flush_interval)
        .with_max_chars(ctx.max_message_chars)
        .with_retry(ctx.retry.clone());
        let flusher = tokio::spawn(flusher.run(shutdown_rx));

        info!("Session for chat {} started (pid {:?})", id, process.pid());

        Arc::new(Self {
            id,
            state: AtomicU8::new(SessionState::Active.as_u8()),
            started_at: Utc::now(),
            process,
            buffer,
            activity,
            shutdown_tx,
            workers: Mutex::new(Some(SessionWorkers { reader, flusher })),
            close_wait: ctx.close_wait,
        })
    }

    pub fn id(&self) -> ChatId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_process_alive(&self) -> bool {
        self.process.is_alive()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> Instant {
        self.activity.last()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        self.activity.idle_for(now)
    }

    pub fn touch(&self) {
        self.activity.touch();
    }

    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            chat_id: self.id,
            state: self.state(),
            pid: self.pid(),
            alive: self.is_process_alive(),
            started_at: self.started_at,
            idle: self.idle_for(Instant::now()),
            pending_bytes: self.buffer.len(),
        }
    }

    /// Forward one accepted command to the interpreter.
    ///
    /// Fails with [`SessionError::Closing`] once the session has left
    /// `Active`, and with [`SessionError::Write`] if the process is gone.
    pub async fn send(&self, command: &str) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closing(self.id));
        }
        self.process.send(command).await?;
        self.touch();
        Ok(())
    }

    /// Shut the session down: terminate the process, let the reader drain
    /// to end-of-stream, then have the flusher deliver what is left.
    ///
    /// Only the caller that moves the session out of `Active` does the work;
    /// everyone else gets `false` back.
    pub async fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Active.as_u8(),
                SessionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("Session for chat {} is already {}", self.id, self.state());
            return false;
        }

        info!("Closing session for chat {}", self.id);

        if let Err(e) = self.process.terminate().await {
            warn!("Session for chat {}: {}", self.id, e);
        }

        let workers = self.workers.lock().await.take();
        if let Some(SessionWorkers { reader, flusher }) = workers {
            join_or_abort(self.id, "reader", reader, self.close_wait).await;
            let _ = self.shutdown_tx.send(true);
            join_or_abort(self.id, "flusher", flusher, self.close_wait).await;
        } else {
            let _ = self.shutdown_tx.send(true);
        }

        self.state
            .store(SessionState::Closed.as_u8(), Ordering::Release);
        info!("Session for chat {} closed", self.id);
        true
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Reader task: move every output chunk into the buffer until the pipes close
async fn read_output(
    chat: ChatId,
    mut output: OutputChunks,
    buffer: Arc<OutputBuffer>,
    activity: Arc<ActivityClock>,
) {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(text) => {
                buffer.append(&text);
                activity.touch();
            }
            Err(e) => {
                warn!("Session for chat {}: {}", chat, e);
                break;
            }
        }
    }
    debug!("Output stream for chat {} ended", chat);
}

async fn join_or_abort(chat: ChatId, name: &str, mut handle: JoinHandle<()>, wait: Duration) {
    match tokio::time::timeout(wait, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Session {} task for chat {} failed: {}", name, chat, e),
        Err(_) => {
            warn!(
                "Session {} task for chat {} did not stop within {:?}, aborting",
                name, chat, wait
            );
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            SessionState::Active,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(SessionState::Closing.to_string(), "closing");
    }

    #[test]
    fn test_activity_clock_idle() {
        let clock = ActivityClock::new();
        clock.touch();
        let last = clock.last();

        assert_eq!(clock.idle_for(last), Duration::ZERO);
        assert_eq!(
            clock.idle_for(last + Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        // A timestamp before the last touch is not negative idle time
        assert_eq!(clock.idle_for(clock.origin), Duration::ZERO);
    }

    #[test]
    fn test_activity_clock_never_moves_backwards() {
        let clock = ActivityClock::new();
        clock.last_ms.store(5_000, Ordering::SeqCst);
        clock.touch();
        assert_eq!(clock.last(), clock.origin + Duration::from_millis(5_000));
    }
}
