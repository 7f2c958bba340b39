//! Long-polling dispatcher
//!
//! Pulls update batches from the chat transport, classifies each message with
//! the sanitizer and routes it: directives are answered directly, code goes
//! to the chat's session, rejections get an explanatory reply.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::BotMetrics;
use crate::sanitizer::{Directive, Sanitizer, Verdict};
use crate::session::{ChatId, SessionRegistry};
use crate::transport::{ChatTransport, InboundMessage, RetryPolicy, TransportError, send_with_retry};

/// Reply when no interpreter can be obtained for a chat
pub const SESSION_UNAVAILABLE: &str =
    "Sorry, the interpreter session is unavailable right now. Please try again later.";

/// Maximum number of attempts to deliver one command, the retry going to a
/// freshly created session.
const FORWARD_ATTEMPTS: usize = 2;

pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    registry: Arc<SessionRegistry>,
    sanitizer: Sanitizer,
    metrics: Arc<BotMetrics>,
    retry: RetryPolicy,
    cursor: Option<i64>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        registry: Arc<SessionRegistry>,
        sanitizer: Sanitizer,
        metrics: Arc<BotMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            registry,
            sanitizer,
            metrics,
            retry,
            cursor: None,
        }
    }

    /// Offset the next poll will ask for
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// Poll until `shutdown` flips. Poll failures are retried forever with
    /// exponential backoff, reset after every successful poll.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Dispatcher started");
        let mut backoff = self.retry.clone().forever().backoff();

        loop {
            let polled = tokio::select! {
                polled = self.poll_once() => polled,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match polled {
                Ok(count) => {
                    backoff.reset();
                    if count > 0 {
                        debug!("Dispatched {} updates", count);
                    }
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(self.retry.max_interval);
                    warn!("Polling for updates failed: {}, retrying in {:?}", e, wait);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("Dispatcher stopped");
    }

    /// Fetch one batch and handle every message in it, in order. Returns the
    /// number of updates received.
    pub async fn poll_once(&mut self) -> Result<usize, TransportError> {
        let batch = match self.transport.fetch_updates(self.cursor).await {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics.record_transport_error();
                return Err(e);
            }
        };

        let count = batch.len();
        for message in batch {
            let next = message.update_id + 1;
            self.cursor = Some(self.cursor.map_or(next, |cursor| cursor.max(next)));
            self.handle_message(&message).await;
        }
        Ok(count)
    }

    /// Route a single inbound message
    pub async fn handle_message(&self, message: &InboundMessage) {
        let Some(text) = message.text.as_deref() else {
            debug!("Skipping update {} without text", message.update_id);
            return;
        };
        let chat = message.chat_id;

        match self.sanitizer.classify(text) {
            Verdict::Ignore => {
                debug!("Ignoring message from chat {}", chat);
            }
            Verdict::Control(directive) => self.handle_directive(chat, directive).await,
            Verdict::Reject(rejection) => {
                self.metrics.record_command_rejected();
                info!("Rejected input from chat {}: {:?}", chat, rejection);
                self.reply(chat, &rejection.to_string()).await;
            }
            Verdict::Forward(code) => self.forward(chat, &code).await,
        }
    }

    /// Deliver `code` to the chat's session. A session found unusable is
    /// closed and the command is resent once to a fresh one.
    async fn forward(&self, chat: ChatId, code: &str) {
        for attempt in 1..=FORWARD_ATTEMPTS {
            let session = match self.registry.get_or_create(chat).await {
                Ok((session, _)) => session,
                Err(e) => {
                    error!("Could not start interpreter for chat {}: {}", chat, e);
                    break;
                }
            };

            match session.send(code).await {
                Ok(()) => {
                    self.metrics.record_command_forwarded();
                    debug!("Forwarded {} bytes to chat {}", code.len(), chat);
                    return;
                }
                Err(e) if e.is_session_unusable() && attempt < FORWARD_ATTEMPTS => {
                    warn!(
                        "Session for chat {} is unusable ({}), starting a fresh one",
                        chat, e
                    );
                    self.registry.close_session(&session).await;
                }
                Err(e) => {
                    error!("Failed to forward command to chat {}: {}", chat, e);
                    break;
                }
            }
        }
        self.reply(chat, SESSION_UNAVAILABLE).await;
    }

    async fn handle_directive(&self, chat: ChatId, directive: Directive) {
        debug!("Chat {} sent {:?}", chat, directive);
        match directive {
            Directive::Help => {
                let help = self.sanitizer.help_text();
                self.reply(chat, &help).await;
            }
            Directive::Start => match self.registry.get_or_create(chat).await {
                Ok((_, true)) => self.reply(chat, "Started a new interpreter session.").await,
                Ok((_, false)) => {
                    self.reply(chat, "An interpreter session is already running.")
                        .await
                }
                Err(e) => {
                    error!("Could not start interpreter for chat {}: {}", chat, e);
                    self.reply(chat, SESSION_UNAVAILABLE).await;
                }
            },
            Directive::Stop => {
                if self.registry.close(chat).await {
                    self.metrics.record_session_stopped();
                    self.reply(chat, "Session closed.").await;
                } else {
                    self.reply(chat, "There is no active session.").await;
                }
            }
            Directive::Status => {
                let status = self.status_text(chat);
                self.reply(chat, &status).await;
            }
        }
    }

    fn status_text(&self, chat: ChatId) -> String {
        let mut lines = Vec::new();
        match self.registry.get(chat) {
            Some(session) => {
                let status = session.status();
                lines.push(format!("Session: {}", status.state));
                match status.pid {
                    Some(pid) if status.alive => lines.push(format!("Interpreter pid: {}", pid)),
                    Some(pid) => lines.push(format!("Interpreter pid: {} (exited)", pid)),
                    None => lines.push("Interpreter pid: unknown".to_string()),
                }
                lines.push(format!(
                    "Started: {}",
                    status.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                ));
                lines.push(format!("Idle: {}", format_duration(status.idle)));
            }
            None => lines.push("No active session. Send some code or /start to begin.".to_string()),
        }

        let metrics = self.metrics.snapshot();
        lines.push(String::new());
        lines.push(format!(
            "Bot: {} sessions running, up {}",
            self.registry.len(),
            format_duration(metrics.uptime)
        ));
        lines.push(format!(
            "Sessions started {}, stopped {}, reaped {}",
            metrics.sessions_started, metrics.sessions_stopped, metrics.sessions_reaped
        ));
        lines.push(format!(
            "Commands forwarded {}, rejected {}",
            metrics.commands_forwarded, metrics.commands_rejected
        ));
        lines.join("\n")
    }

    async fn reply(&self, chat: ChatId, text: &str) {
        if let Err(e) = send_with_retry(self.transport.as_ref(), chat, text, &self.retry).await {
            self.metrics.record_transport_error();
            error!("Failed to reply to chat {}: {}", chat, e);
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7320)), "2h 2m");
    }
}
