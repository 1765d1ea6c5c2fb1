//! Client side of the resume contract.
//!
//! A client that loses its stream keeps a [`ResumeTicket`] for the response it
//! was following and a [`ResumeCursor`] of what it already rendered. On
//! reconnect it asks the relay for the session's active responses and lets
//! [`decide`] pick between resuming, reloading the final state, or dropping
//! the ticket.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::ActiveResponse;

/// Tracks the highest event index a subscriber has delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeCursor {
    highest: Option<u64>,
}

impl ResumeCursor {
    pub const fn new() -> Self {
        Self { highest: None }
    }

    /// Whether `idx` is new. Indices at or below the highest seen are duplicates.
    pub fn accept(&mut self, idx: u64) -> bool {
        match self.highest {
            Some(high) if idx <= high => false,
            _ => {
                self.highest = Some(idx);
                true
            }
        }
    }

    pub const fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// `start_from` to request on reconnect.
    pub const fn next_start(&self) -> u64 {
        match self.highest {
            Some(high) => high + 1,
            None => 0,
        }
    }
}

/// What a client remembers about the response it is following.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTicket {
    pub session_id: String,
    pub response_id: String,
    pub epoch: u64,
}

/// Outcome of a reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Re-subscribe from `start_from`.
    Resume { start_from: u64 },
    /// The response finished while away; fetch its status instead.
    ReloadFinal,
    /// The ticket is stale and must be dropped.
    Discard,
}

/// Decide how to continue following `ticket`.
///
/// `client_epoch` is the epoch the client currently considers live for the
/// session, `active` the relay's reply to the active query for that session.
pub fn decide(
    ticket: &ResumeTicket,
    client_epoch: u64,
    cursor: &ResumeCursor,
    active: &ActiveResponse,
) -> ResumeDecision {
    if ticket.epoch != client_epoch {
        return ResumeDecision::Discard;
    }

    let still_active = active.active.iter().any(|id| id == &ticket.response_id);
    let server_epoch = active.epoch.unwrap_or(ticket.epoch);

    if still_active {
        if server_epoch == ticket.epoch {
            ResumeDecision::Resume {
                start_from: cursor.next_start(),
            }
        } else {
            ResumeDecision::Discard
        }
    } else if server_epoch > ticket.epoch {
        ResumeDecision::Discard
    } else {
        ResumeDecision::ReloadFinal
    }
}

/// Latest epoch the client has seen per session.
#[derive(Debug, Clone, Default)]
pub struct SessionEpochs {
    epochs: HashMap<String, u64>,
}

impl SessionEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `epoch` for `session_id`. Older epochs never win.
    pub fn observe(&mut self, session_id: &str, epoch: u64) -> u64 {
        let current = self.epochs.entry(session_id.to_string()).or_insert(epoch);
        if epoch > *current {
            *current = epoch;
        }
        *current
    }

    pub fn current(&self, session_id: &str) -> Option<u64> {
        self.epochs.get(session_id).copied()
    }
}
