//! Relay module types.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::LockError;
use crate::storage::DatabaseError;

/// Text of the terminal error appended when a generation is stopped.
pub const STOPPED_MESSAGE: &str = "Generation stopped.";

/// Runtime settings of the relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub lock_lease: Duration,
    pub partial_messages: bool,
    pub uploads_dir: PathBuf,
    pub attachments_dir: PathBuf,
}

/// Errors from relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Session {session_id} already has a generation in progress")]
    LockBusy {
        session_id: String,
        response_id: String,
    },

    #[error("All {max} generation slots are busy")]
    PoolExhausted { max: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Relay is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl From<LockError> for RelayError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy {
                session_id,
                response_id,
            } => Self::LockBusy {
                session_id,
                response_id,
            },
        }
    }
}

/// Why a stream subscription was refused. Sent as a single `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRejection {
    NotFound,
    StaleEpoch,
}

impl StreamRejection {
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotFound => "Response not found.",
            Self::StaleEpoch => "Stale epoch.",
        }
    }
}
