//! Mock chat transport for testing
//! Scripts inbound batches and records everything sent, so the dispatcher and
//! flushers can be exercised without a network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};

use super::{ChatId, ChatTransport, InboundMessage, TransportError};

type ErrorFactory = Box<dyn Fn() -> TransportError + Send>;

/// In-memory transport with scripted inbound traffic
pub struct MockTransport {
    batches: Mutex<VecDeque<Result<Vec<InboundMessage>, TransportError>>>,
    cursors: Mutex<Vec<Option<i64>>>,
    sent: Mutex<Vec<(ChatId, String)>>,
    send_failures: Mutex<VecDeque<ErrorFactory>>,
    send_attempts: AtomicUsize,
    idle_poll: Duration,
}

impl MockTransport {
    /// Create a new MockTransport
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            cursors: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            send_failures: Mutex::new(VecDeque::new()),
            send_attempts: AtomicUsize::new(0),
            idle_poll: Duration::from_millis(10),
        }
    }

    /// Queue a batch to be returned by the next `fetch_updates`
    pub fn push_batch(&self, batch: Vec<InboundMessage>) {
        self.lock_batches().push_back(Ok(batch));
    }

    /// Queue a failing poll
    pub fn push_fetch_error(&self, error: TransportError) {
        self.lock_batches().push_back(Err(error));
    }

    /// Make the next `count` sends fail with errors built by `factory`
    pub fn fail_next_sends<F>(&self, count: usize, factory: F)
    where
        F: Fn() -> TransportError + Send + Clone + 'static,
    {
        let mut failures = self.send_failures.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            failures.push_back(Box::new(factory.clone()));
        }
    }

    /// Cursors passed to `fetch_updates`, in call order
    pub fn cursors(&self) -> Vec<Option<i64>> {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Every delivered message, in delivery order
    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Messages delivered to one chat, in delivery order
    pub fn sent_to(&self, chat: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| *id == chat)
            .map(|(_, text)| text)
            .collect()
    }

    /// Number of `send_message` calls, failed ones included
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Whether every scripted batch has been consumed
    pub fn is_drained(&self) -> bool {
        self.lock_batches().is_empty()
    }

    /// Wait until `chat` has received text for which `done` holds, returning
    /// its concatenated messages. Gives up after `timeout`.
    pub async fn wait_for<F>(&self, chat: ChatId, timeout: Duration, done: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let text = self.sent_to(chat).concat();
            if done(&text) || Instant::now() >= deadline {
                return text;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn lock_batches(
        &self,
    ) -> std::sync::MutexGuard<'_, VecDeque<Result<Vec<InboundMessage>, TransportError>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn fetch_updates(
        &self,
        cursor: Option<i64>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cursor);

        let next = self.lock_batches().pop_front();
        match next {
            Some(batch) => batch,
            None => {
                // Simulate an empty long poll
                sleep(self.idle_poll).await;
                Ok(Vec::new())
            }
        }
    }

    async fn send_message(&self, chat: ChatId, text: &str) -> Result<(), TransportError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        let failure = self
            .send_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(factory) = failure {
            return Err(factory());
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((chat, text.to_string()));
        Ok(())
    }
}
