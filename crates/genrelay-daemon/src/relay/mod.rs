//! Generation relay: from a submission to a replayable event log.
//!
//! Ties together:
//! - SessionLocks (one generation per session)
//! - WorkerPool (bounded, supervised background generations)
//! - SubprocessManager + EventBridge (process output → events)
//! - ResponseRegistry (ordered, replayable logs)
//! - TranscriptStore (final results)

mod pipeline;
mod pool;
pub mod prompt;
mod service;
mod types;

pub use pool::{PoolError, PoolPermit, WorkerPool};
pub use service::GenerationRelay;
pub use types::*;
