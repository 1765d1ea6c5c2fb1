//! Per-session generation lock.
//!
//! At most one generation runs per session. A second submission is rejected,
//! never queued.

mod lock;
mod types;

pub use lock::SessionLocks;
pub use types::{LockError, LockGrant, LockToken};
