//! Session lock types.

use std::time::Duration;

use tokio::time::Instant;

/// Proof of holding a session lock. Only the matching token releases it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub(crate) session_id: String,
    pub(crate) id: u64,
}

impl LockToken {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Result of a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub token: LockToken,
    /// Response whose expired lease was reclaimed, if any.
    pub evicted: Option<String>,
}

/// Current holder of a session lock.
#[derive(Debug, Clone)]
pub(crate) struct Holder {
    pub token_id: u64,
    pub response_id: String,
    pub acquired_at: Instant,
    pub renewed_at: Instant,
    pub lease: Duration,
}

impl Holder {
    pub fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.renewed_at) < self.lease
    }
}

/// Session lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Session {session_id} is busy with response {response_id}")]
    Busy {
        session_id: String,
        response_id: String,
    },
}
