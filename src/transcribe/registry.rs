use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use super::session::SessionHandle;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transcription is already active for this guild")]
    AlreadyActive,
}

/// Process-wide map of active transcription sessions, one per guild at most.
/// Entries are added and removed only through explicit start/stop; nothing
/// is garbage-collected behind the caller's back.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned session. Fails without disturbing the
    /// existing session if one is already active for the guild; the rejected
    /// handle is shut down before returning.
    pub fn insert(&self, handle: SessionHandle) -> Result<(), SessionError> {
        match self.sessions.entry(handle.guild_id()) {
            Entry::Occupied(_) => {
                handle.shutdown();
                Err(SessionError::AlreadyActive)
            }
            Entry::Vacant(slot) => {
                info!("({}) Started transcription session", handle.guild_id());
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Stop and remove the guild's session. Returns false if none exists.
    /// The worker cancels its sweep and grace timers on the way out;
    /// releasing the voice connection is the caller's side of the stop.
    pub fn stop(&self, guild_id: u64) -> bool {
        match self.sessions.remove(&guild_id) {
            Some((_, handle)) => {
                handle.shutdown();
                info!("({}) Stopped transcription session", guild_id);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, guild_id: u64) -> bool {
        self.sessions.contains_key(&guild_id)
    }
}
