//! Following a response across disconnects.
//!
//! A follower streams a response, hands each new event to a callback
//! exactly once, and on disconnect asks the relay whether to resume, reload
//! the final state, or give the ticket up.

use std::time::Duration;

use genrelay_core::event::{EventPayload, RelayEvent};
use genrelay_core::resume::{ResumeCursor, ResumeDecision, ResumeTicket, SessionEpochs, decide};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::client::{ClientError, RelayApi};

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// How following a response ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowOutcome {
    /// The terminal event (`done` or `error`).
    Finished(EventPayload),
    /// The relay refused the stream (unknown response or stale epoch).
    Rejected(String),
    /// A newer generation replaced this one.
    Discarded,
}

/// Follow `ticket` until it finishes, delivering each event once.
pub async fn follow<A, F>(
    api: &A,
    ticket: &ResumeTicket,
    start_from: u64,
    policy: &ReconnectPolicy,
    mut on_event: F,
) -> Result<FollowOutcome, ClientError>
where
    A: RelayApi + ?Sized,
    F: FnMut(&RelayEvent),
{
    let mut epochs = SessionEpochs::new();
    let client_epoch = epochs.observe(&ticket.session_id, ticket.epoch);
    let mut cursor = ResumeCursor::new();
    if let Some(seen) = start_from.checked_sub(1) {
        cursor.accept(seen);
    }
    let mut start_from = start_from;
    let mut attempt = 0;

    loop {
        let before = cursor.highest();
        match stream_once(api, ticket, start_from, &mut cursor, &mut on_event).await {
            Ok(Some(outcome)) => return Ok(outcome),
            Ok(None) => debug!(response_id = %ticket.response_id, "Stream ended early"),
            Err(e) => warn!(response_id = %ticket.response_id, error = %e, "Stream failed"),
        }
        if cursor.highest() != before {
            attempt = 0;
        }

        if !policy.should_retry(attempt) {
            return Err(ClientError::GaveUp { attempts: attempt });
        }
        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        info!(
            response_id = %ticket.response_id,
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting"
        );
        tokio::time::sleep(delay).await;

        let active = match api.active(&ticket.session_id).await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "Active query failed");
                continue;
            }
        };
        match decide(ticket, client_epoch, &cursor, &active) {
            ResumeDecision::Resume { start_from: next } => start_from = next,
            ResumeDecision::ReloadFinal => {
                match reload(api, ticket, &mut cursor, &mut on_event).await? {
                    Some(outcome) => return Ok(outcome),
                    None => start_from = cursor.next_start(),
                }
            }
            ResumeDecision::Discard => {
                info!(response_id = %ticket.response_id, "Response superseded");
                return Ok(FollowOutcome::Discarded);
            }
        }
    }
}

/// One stream connection. `None` means it ended before a terminal event.
async fn stream_once<A, F>(
    api: &A,
    ticket: &ResumeTicket,
    start_from: u64,
    cursor: &mut ResumeCursor,
    on_event: &mut F,
) -> Result<Option<FollowOutcome>, ClientError>
where
    A: RelayApi + ?Sized,
    F: FnMut(&RelayEvent),
{
    let mut frames = api
        .open_stream(&ticket.response_id, start_from, Some(ticket.epoch))
        .await?;
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let (idx, payload) = match frame.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "Undecodable stream event");
                continue;
            }
        };
        let Some(idx) = idx else {
            if let EventPayload::Error { message } = payload {
                return Ok(Some(FollowOutcome::Rejected(message)));
            }
            continue;
        };
        if let Some(outcome) = deliver(RelayEvent::new(idx, payload), cursor, on_event) {
            return Ok(Some(outcome));
        }
    }
    Ok(None)
}

/// Replay the buffered events of a response that finished while away.
async fn reload<A, F>(
    api: &A,
    ticket: &ResumeTicket,
    cursor: &mut ResumeCursor,
    on_event: &mut F,
) -> Result<Option<FollowOutcome>, ClientError>
where
    A: RelayApi + ?Sized,
    F: FnMut(&RelayEvent),
{
    let Some(status) = api.status(&ticket.response_id).await? else {
        return Ok(Some(FollowOutcome::Rejected("Response not found.".into())));
    };
    for event in status.events {
        if let Some(outcome) = deliver(event, cursor, on_event) {
            return Ok(Some(outcome));
        }
    }
    Ok(None)
}

fn deliver<F>(
    event: RelayEvent,
    cursor: &mut ResumeCursor,
    on_event: &mut F,
) -> Option<FollowOutcome>
where
    F: FnMut(&RelayEvent),
{
    if !cursor.accept(event.idx) {
        return None;
    }
    on_event(&event);
    event
        .is_terminal()
        .then_some(FollowOutcome::Finished(event.payload))
}
