//! Mapping from chat id to its live session

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tracing::{debug, info};

use super::chat_session::{ChatSession, SessionState};
use super::error::SessionError;
use super::process::ProcessAdapter;
use super::{ChatId, SessionContext};

/// Registry of chat sessions.
///
/// The map lock is held only for map operations. Spawning, terminating and
/// flushing all happen outside it, which is why lookups hand out `Arc`s and
/// iteration goes through [`SessionRegistry::snapshot`].
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ChatId, Arc<ChatSession>>>,
    ctx: SessionContext,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ctx,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// The chat's session if it is still `Active`. A session that has started
    /// closing counts as absent.
    pub fn get(&self, chat: ChatId) -> Option<Arc<ChatSession>> {
        self.lock_sessions()
            .get(&chat)
            .filter(|session| session.is_active())
            .cloned()
    }

    /// Return the chat's active session, or spawn and register a new one.
    ///
    /// The second element is `true` when a session was created. Spawn
    /// failures are returned and nothing is registered.
    pub async fn get_or_create(
        &self,
        chat: ChatId,
    ) -> Result<(Arc<ChatSession>, bool), SessionError> {
        if let Some(existing) = self.get(chat) {
            return Ok((existing, false));
        }

        let process = ProcessAdapter::start(
            &self.ctx.interpreter,
            self.ctx.terminate_grace,
            self.ctx.write_timeout,
        )?;

        let (session, unused) = {
            let mut sessions = self.lock_sessions();
            let existing = sessions
                .get(&chat)
                .filter(|session| session.is_active())
                .cloned();
            match existing {
                Some(existing) => (existing, Some(process)),
                None => {
                    let session = ChatSession::launch(chat, process, &self.ctx);
                    // Replaces any entry that is still finishing its close
                    sessions.insert(chat, session.clone());
                    (session, None)
                }
            }
        };

        if let Some(process) = unused {
            debug!("Lost session creation race for chat {}", chat);
            let _ = process.terminate().await;
            return Ok((session, false));
        }

        self.ctx.metrics.record_session_started();
        info!("Registered new session for chat {}", chat);
        Ok((session, true))
    }

    /// Drop `session` from the map. Only a `Closed` session that is still
    /// the chat's current entry is removed.
    pub fn remove(&self, session: &Arc<ChatSession>) -> bool {
        let mut sessions = self.lock_sessions();
        let is_current = sessions
            .get(&session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if is_current && session.state() == SessionState::Closed {
            sessions.remove(&session.id());
            debug!("Removed session for chat {}", session.id());
            true
        } else {
            false
        }
    }

    /// Point-in-time copy of every registered session
    pub fn snapshot(&self) -> Vec<Arc<ChatSession>> {
        self.lock_sessions().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }

    /// Close the chat's active session and remove it. Returns `false` when
    /// there was nothing to close.
    pub async fn close(&self, chat: ChatId) -> bool {
        match self.get(chat) {
            Some(session) => self.close_session(&session).await,
            None => false,
        }
    }

    /// Close `session` and remove it from the map
    pub async fn close_session(&self, session: &Arc<ChatSession>) -> bool {
        let closed = session.close().await;
        self.remove(session);
        closed
    }

    /// Close every registered session concurrently. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return 0;
        }
        info!("Closing {} sessions", sessions.len());

        let mut closing: FuturesUnordered<_> = sessions
            .iter()
            .map(|session| self.close_session(session))
            .collect();

        let mut closed = 0;
        while let Some(done) = closing.next().await {
            if done {
                closed += 1;
            }
        }
        closed
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<ChatId, Arc<ChatSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
