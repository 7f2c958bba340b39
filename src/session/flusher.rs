//! Periodic delivery of buffered interpreter output

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::ChatId;
use super::buffer::OutputBuffer;
use super::chat_session::ActivityClock;
use crate::metrics::BotMetrics;
use crate::transport::{ChatTransport, RetryPolicy, send_with_retry};

/// Telegram's limit for a single text message
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4096;

/// Per-session task that drains the output buffer on a fixed interval and
/// sends what it finds to the chat.
pub struct Flusher {
    chat: ChatId,
    buffer: Arc<OutputBuffer>,
    activity: Arc<ActivityClock>,
    transport: Arc<dyn ChatTransport>,
    metrics: Arc<BotMetrics>,
    interval: Duration,
    max_chars: usize,
    retry: RetryPolicy,
}

impl Flusher {
    pub fn new(
        chat: ChatId,
        buffer: Arc<OutputBuffer>,
        activity: Arc<ActivityClock>,
        transport: Arc<dyn ChatTransport>,
        metrics: Arc<BotMetrics>,
    ) -> Self {
        Self {
            chat,
            buffer,
            activity,
            transport,
            metrics,
            interval: Duration::from_secs(1),
            max_chars: DEFAULT_MAX_MESSAGE_CHARS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Flush every interval until `shutdown` flips (or its sender is gone),
    /// then flush one last time and stop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.flush().await;
                        break;
                    }
                }
            }
        }
        debug!("Flusher for chat {} stopped", self.chat);
    }

    /// Drain the buffer and deliver it. Returns the number of messages sent.
    ///
    /// An empty drain sends nothing. Text longer than the message limit goes
    /// out as several messages in order.
    pub async fn flush(&self) -> usize {
        let text = self.buffer.drain_all();
        if text.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for part in split_message(&text, self.max_chars) {
            if part.trim().is_empty() {
                // The chat service refuses blank messages
                debug!("Skipping blank output for chat {}", self.chat);
                continue;
            }
            match send_with_retry(self.transport.as_ref(), self.chat, &part, &self.retry).await {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.record_message_flushed();
                    self.activity.touch();
                }
                Err(e) => {
                    self.metrics.record_transport_error();
                    error!(
                        "Dropping {} bytes of output for chat {}: {}",
                        part.len(),
                        self.chat,
                        e
                    );
                }
            }
        }
        delivered
    }
}

/// Split `text` into pieces of at most `max_units` UTF-16 code units (the
/// chat service's unit of length), preferring to break after a newline.
///
/// Concatenating the pieces gives back `text` exactly.
pub fn split_message(text: &str, max_units: usize) -> Vec<String> {
    let max_units = max_units.max(1);
    let mut parts = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let mut units = 0;
        let mut limit = rest.len();
        for (idx, ch) in rest.char_indices() {
            units += ch.len_utf16();
            if units > max_units {
                limit = idx;
                break;
            }
        }
        if limit == rest.len() {
            parts.push(rest.to_string());
            break;
        }
        // A single character wider than the limit still has to go somewhere
        if limit == 0 {
            limit = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }

        let cut = match rest[..limit].rfind('\n') {
            Some(newline) => newline + 1,
            None => limit,
        };
        parts.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    parts
}
