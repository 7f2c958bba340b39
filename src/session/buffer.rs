//! Lock-guarded accumulator of interpreter output awaiting delivery

use std::sync::Mutex;

/// Pending output for one session.
///
/// The reader task appends and the flusher drains. Both operations take the
/// same lock for their whole duration, so an append is either fully inside a
/// drain's result or fully left for the next one.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pending: Mutex<String>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk at the end of the pending text
    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push_str(chunk);
    }

    /// Take everything pending, leaving the buffer empty
    pub fn drain_all(&self) -> String {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
