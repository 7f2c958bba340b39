//! Inactivity reaper

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::ChatId;
use super::chat_session::ChatSession;
use super::registry::SessionRegistry;
use crate::config::SessionConfig;
use crate::metrics::BotMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapReason {
    Idle(Duration),
    Exited,
}

/// Global task that closes sessions idle for longer than the timeout, and
/// sessions whose interpreter has already exited.
pub struct Reaper {
    registry: Arc<SessionRegistry>,
    metrics: Arc<BotMetrics>,
    timeout: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        metrics: Arc<BotMetrics>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            timeout,
            interval,
        }
    }

    pub fn from_config(
        registry: Arc<SessionRegistry>,
        metrics: Arc<BotMetrics>,
        config: &SessionConfig,
    ) -> Self {
        Self::new(
            registry,
            metrics,
            Duration::from_secs(config.inactivity_timeout_secs),
            Duration::from_secs(config.reap_interval_secs),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sweep every interval until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Reaper started: timeout {:?}, sweep every {:?}",
            self.timeout, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reaper stopped");
    }

    pub async fn sweep(&self) -> Vec<ChatId> {
        self.sweep_at(Instant::now()).await
    }

    /// Close every active session that is due at `now`. Returns the chats
    /// whose sessions this sweep closed.
    pub async fn sweep_at(&self, now: Instant) -> Vec<ChatId> {
        info!("Running inactivity sweep");

        let due: Vec<(Arc<ChatSession>, ReapReason)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| session.is_active())
            .filter_map(|session| {
                let reason = self.reap_reason(&session, now)?;
                Some((session, reason))
            })
            .collect();

        let mut closing: FuturesUnordered<_> = due
            .into_iter()
            .map(|(session, reason)| async move {
                match reason {
                    ReapReason::Idle(idle) => {
                        info!("Reaping chat {} after {:?} idle", session.id(), idle)
                    }
                    ReapReason::Exited => {
                        info!("Reaping chat {}: interpreter exited", session.id())
                    }
                }
                let closed = self.registry.close_session(&session).await;
                (session.id(), closed)
            })
            .collect();

        let mut reaped = Vec::new();
        while let Some((chat, closed)) = closing.next().await {
            if closed {
                self.metrics.record_session_reaped();
                reaped.push(chat);
            }
        }

        info!(
            "Finished inactivity sweep: reaped {}, {} remaining",
            reaped.len(),
            self.registry.len()
        );
        debug!("{}", self.metrics.snapshot());
        reaped
    }

    fn reap_reason(&self, session: &ChatSession, now: Instant) -> Option<ReapReason> {
        let idle = session.idle_for(now);
        if idle > self.timeout {
            Some(ReapReason::Idle(idle))
        } else if !session.is_process_alive() {
            Some(ReapReason::Exited)
        } else {
            None
        }
    }
}
