//! A single response's event log and status.

use std::time::Duration;

use genrelay_core::api::StatusResponse;
use genrelay_core::event::{EventPayload, RelayEvent, ResponseStatus};
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Immutable facts about a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub response_id: String,
    pub session_id: String,
    pub mode: String,
    pub epoch: u64,
}

#[derive(Debug)]
struct SlotState {
    status: ResponseStatus,
    events: Vec<RelayEvent>,
    /// A terminal event was appended.
    sealed: bool,
    final_result: Option<String>,
    context_percent: Option<f64>,
    error: Option<String>,
    last_active_at: Instant,
    terminal_at: Option<Instant>,
}

/// Event log of one response. Written only by its worker.
#[derive(Debug)]
pub struct ResponseSlot {
    meta: ResponseMeta,
    created_at: Instant,
    state: RwLock<SlotState>,
    /// Bumped on every append and status change.
    changed: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl ResponseSlot {
    pub(super) fn new(meta: ResponseMeta) -> Self {
        let now = Instant::now();
        let (changed, _) = watch::channel(0);
        Self {
            meta,
            created_at: now,
            state: RwLock::new(SlotState {
                status: ResponseStatus::Pending,
                events: Vec::new(),
                sealed: false,
                final_result: None,
                context_percent: None,
                error: None,
                last_active_at: now,
                terminal_at: None,
            }),
            changed,
            cancel: CancellationToken::new(),
        }
    }

    pub const fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Token cancelled by a stop request.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(super) fn watch(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn bump(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub async fn status(&self) -> ResponseStatus {
        self.state.read().await.status
    }

    /// Append an event, assigning the next index.
    ///
    /// Returns `None` once a terminal event was appended or the status is
    /// terminal.
    pub async fn append(&self, payload: EventPayload) -> Option<u64> {
        let mut state = self.state.write().await;
        if state.sealed || state.status.is_terminal() {
            warn!(
                response_id = %self.meta.response_id,
                event = payload.name(),
                "Dropping event appended after terminal state"
            );
            return None;
        }

        let idx = state.events.len() as u64;
        if payload.is_terminal() {
            state.sealed = true;
        }
        if let EventPayload::Result {
            context_percent,
            ref text,
            ..
        } = payload
        {
            state.context_percent = Some(context_percent);
            state.final_result = Some(text.clone());
        }
        if let EventPayload::Error { ref message } = payload {
            state.error = Some(message.clone());
        }
        state.events.push(RelayEvent::new(idx, payload));
        state.last_active_at = Instant::now();
        drop(state);

        self.bump();
        Some(idx)
    }

    /// Events with `idx >= start`, and whether the log is closed for appends.
    pub async fn events_from(&self, start: u64) -> (Vec<RelayEvent>, bool) {
        let state = self.state.read().await;
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        let events = state.events.get(start..).map(<[_]>::to_vec).unwrap_or_default();
        (events, state.sealed || state.status.is_terminal())
    }

    pub async fn mark_running(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status != ResponseStatus::Pending {
            return false;
        }
        state.status = ResponseStatus::Running;
        state.last_active_at = Instant::now();
        drop(state);
        self.bump();
        true
    }

    /// Move to a terminal status. The first terminal transition wins.
    pub async fn mark_terminal(&self, status: ResponseStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        if error.is_some() {
            state.error = error;
        }
        let now = Instant::now();
        state.terminal_at = Some(now);
        state.last_active_at = now;
        drop(state);

        debug!(response_id = %self.meta.response_id, %status, "Response finished");
        self.bump();
        true
    }

    /// Append the terminal event and set the terminal status in one step.
    ///
    /// Readers are not woken; call [`notify`](Self::notify) once the
    /// session lock is released so a client reacting to the terminal event
    /// never finds the session still held.
    pub async fn finish(&self, payload: EventPayload, status: ResponseStatus) -> Option<u64> {
        debug_assert!(payload.is_terminal() && status.is_terminal());
        let mut state = self.state.write().await;
        if state.sealed || state.status.is_terminal() {
            return None;
        }

        let idx = state.events.len() as u64;
        if let EventPayload::Error { ref message } = payload {
            state.error = Some(message.clone());
        }
        state.events.push(RelayEvent::new(idx, payload));
        state.sealed = true;
        state.status = status;
        let now = Instant::now();
        state.terminal_at = Some(now);
        state.last_active_at = now;
        drop(state);

        debug!(response_id = %self.meta.response_id, %status, idx, "Response finished");
        Some(idx)
    }

    /// Wake subscribers after a [`finish`](Self::finish).
    pub fn notify(&self) {
        self.bump();
    }

    /// Resolve once the response reached a terminal status.
    pub async fn settled(&self) {
        let mut changed = self.watch();
        loop {
            changed.mark_unchanged();
            if self.status().await.is_terminal() || changed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record the final text when no result event carried it.
    pub async fn set_final_result(&self, text: String) {
        let mut state = self.state.write().await;
        if state.final_result.as_deref().is_none_or(str::is_empty) {
            state.final_result = Some(text);
        }
    }

    pub async fn snapshot(&self) -> StatusResponse {
        let state = self.state.read().await;
        StatusResponse {
            status: state.status,
            events: state.events.clone(),
            final_result: state.final_result.clone(),
            context_percent: state.context_percent,
            error: state.error.clone(),
            session_id: self.meta.session_id.clone(),
            epoch: self.meta.epoch,
        }
    }

    /// Time since the last append or status change.
    pub async fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.read().await.last_active_at)
    }

    /// Terminal and past the retention window as of `now`.
    pub(super) async fn expired(&self, now: Instant, retention: Duration) -> bool {
        let state = self.state.read().await;
        state.status.is_terminal()
            && state
                .terminal_at
                .is_some_and(|at| now.saturating_duration_since(at) > retention)
    }
}
