//! Daemon-wide session registry.
//!
//! The map is guarded by a plain mutex held only for insert/remove/snapshot;
//! nothing sends while holding it. Broadcast traffic (ticks, approval
//! events) reaches sessions through a channel each one subscribes to, so a
//! slow peer can never block the daemon or another session.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) struct SessionHandle {
    pub cancel: CancellationToken,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub(crate) fn insert(&self, id: Uuid, handle: SessionHandle) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, handle);
        }
    }

    pub(crate) fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.lock().ok()?.remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Cancel every session. Tokens are snapshotted under the lock and
    /// triggered after it is released.
    pub(crate) fn shutdown_all(&self) {
        let tokens: Vec<CancellationToken> = match self.sessions.lock() {
            Ok(sessions) => sessions.values().map(|h| h.cancel.clone()).collect(),
            Err(_) => return,
        };
        for token in tokens {
            token.cancel();
        }
    }
}
