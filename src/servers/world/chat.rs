//! Broadcast channel for sessions in the game phase.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::packet::{PacketSchema, Record};
use crate::session::{SessionHandle, SessionId};

#[derive(Default)]
pub struct ChatChannel {
    members: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl ChatChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, handle: SessionHandle) {
        self.lock().insert(handle.id(), handle);
    }

    pub fn leave(&self, id: SessionId) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `record` on every member. Members whose session has ended are
    /// dropped. Returns how many received it.
    pub fn broadcast(&self, schema: &Arc<PacketSchema>, record: &Record) -> usize {
        let mut members = self.lock();
        members.retain(|id, handle| match handle.send(schema.clone(), record.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("[world] [chat] dropping closed member id={}", id);
                false
            }
        });
        members.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
