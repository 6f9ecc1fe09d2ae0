//! Registry of live sessions, keyed by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use super::{CloseReason, SessionError, SessionHandle, SessionId};

/// Default cap on concurrent sessions
pub const MAX_SESSIONS: usize = 1024;

/// Thread-safe table of session handles
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1), // 0 is never handed out
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Allocate a fresh session id. Ids are never reused.
    pub fn allocate_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a live session
    pub async fn insert(&self, handle: SessionHandle) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsExceeded(self.max_sessions));
        }

        sessions.insert(handle.id(), handle);
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ask every live session to close. Returns how many accepted.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let sessions = self.sessions.read().await;
        tracing::info!("[session] Shutting down {} sessions", sessions.len());

        sessions
            .values()
            .filter(|handle| {
                let accepted = handle.close(reason);
                if !accepted {
                    tracing::debug!("[session] id={} already gone", handle.id());
                }
                accepted
            })
            .count()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(MAX_SESSIONS)
    }
}
