//! Metrics collection module
//!
//! Process-wide counters for session lifecycle and message traffic. They are
//! shown by `/status` and logged after every inactivity sweep.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by the dispatcher, the reaper and every flusher
#[derive(Debug)]
pub struct BotMetrics {
    started: Instant,
    sessions_started: AtomicU64,
    sessions_stopped: AtomicU64,
    sessions_reaped: AtomicU64,
    commands_forwarded: AtomicU64,
    commands_rejected: AtomicU64,
    messages_flushed: AtomicU64,
    transport_errors: AtomicU64,
}

/// Point-in-time copy of [`BotMetrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub sessions_reaped: u64,
    pub commands_forwarded: u64,
    pub commands_rejected: u64,
    pub messages_flushed: u64,
    pub transport_errors: u64,
}

impl BotMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            sessions_started: AtomicU64::new(0),
            sessions_stopped: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            commands_forwarded: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            messages_flushed: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A session closed on request (`/kill`, `/stop`)
    pub fn record_session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_reaped(&self) {
        self.sessions_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_forwarded(&self) {
        self.commands_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_flushed(&self) {
        self.messages_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Sessions started and not yet stopped or reaped
    pub fn live_sessions(&self) -> u64 {
        let snapshot = self.snapshot();
        snapshot
            .sessions_started
            .saturating_sub(snapshot.sessions_stopped + snapshot.sessions_reaped)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: self.started.elapsed(),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            commands_forwarded: self.commands_forwarded.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for BotMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime {}s, sessions started {} / stopped {} / reaped {}, \
             commands forwarded {} / rejected {}, messages flushed {}, transport errors {}",
            self.uptime.as_secs(),
            self.sessions_started,
            self.sessions_stopped,
            self.sessions_reaped,
            self.commands_forwarded,
            self.commands_rejected,
            self.messages_flushed,
            self.transport_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let snapshot = BotMetrics::new().snapshot();
        assert_eq!(snapshot.sessions_started, 0);
        assert_eq!(snapshot.transport_errors, 0);
    }

    #[test]
    fn test_live_sessions() {
        let metrics = BotMetrics::new();
        for _ in 0..3 {
            metrics.record_session_started();
        }
        metrics.record_session_stopped();
        metrics.record_session_reaped();
        assert_eq!(metrics.live_sessions(), 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(BotMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_message_flushed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().messages_flushed, 4000);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = BotMetrics::new();
        metrics.record_command_rejected();
        let line = metrics.snapshot().to_string();
        assert!(line.contains("rejected 1"));
    }
}
