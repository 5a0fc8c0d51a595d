use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use lanpush_core::device::MacAddress;

use crate::events::Direction;

/// What the engine knows about the single live session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_mac: MacAddress,
    pub peer_name: String,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(peer_mac: MacAddress, peer_name: impl Into<String>, direction: Direction) -> Self {
        Self {
            peer_mac,
            peer_name: peer_name.into(),
            direction,
            started_at: Utc::now(),
        }
    }
}

/// The engine's busy flag.
///
/// Holds at most one [`SessionInfo`]. The engine is busy exactly while the
/// slot is occupied. Claiming is atomic, so two racing connections can
/// never both get a session; the loser gets `None` and must refuse.
#[derive(Clone, Debug, Default)]
pub struct SessionSlot {
    inner: Arc<Mutex<Option<SessionInfo>>>,
}

impl SessionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    pub fn current(&self) -> Option<SessionInfo> {
        self.lock().clone()
    }

    /// Occupies the slot, or returns `None` without side effects if it is
    /// already taken.
    #[must_use]
    pub fn try_claim(&self, info: SessionInfo) -> Option<SessionClaim> {
        let mut slot = self.lock();
        if slot.is_some() {
            return None;
        }
        debug!(peer = %info.peer_name, direction = ?info.direction, "Session slot claimed");
        *slot = Some(info);
        Some(SessionClaim { slot: self.clone() })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionInfo>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of owning the session slot. Dropping it frees the slot on every
/// exit path, including panics and early returns.
#[derive(Debug)]
pub struct SessionClaim {
    slot: SessionSlot,
}

impl SessionClaim {
    pub fn info(&self) -> Option<SessionInfo> {
        self.slot.current()
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        debug!("Session slot released");
        self.slot.lock().take();
    }
}
