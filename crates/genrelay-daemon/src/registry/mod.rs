//! In-memory response registry.
//!
//! Every generation gets a [`ResponseSlot`] holding its ordered event log and
//! status. Subscribers read the log through [`subscribe`] and wait on the
//! slot's append notification. Terminal entries are swept after the
//! retention window.

mod slot;
mod subscribe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use genrelay_core::api::StatusResponse;
use genrelay_core::event::{EventPayload, RelayEvent, ResponseStatus};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

pub use slot::{ResponseMeta, ResponseSlot};
pub use subscribe::subscribe;

/// Registry of live and recently finished responses.
#[derive(Debug)]
pub struct ResponseRegistry {
    responses: RwLock<HashMap<String, Arc<ResponseSlot>>>,
    /// Latest epoch handed out per session.
    epochs: RwLock<HashMap<String, u64>>,
    retention: Duration,
}

impl ResponseRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            responses: RwLock::new(HashMap::new()),
            epochs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub const fn retention(&self) -> Duration {
        self.retention
    }

    /// Register a pending response and assign the session's next epoch.
    pub async fn create(&self, response_id: &str, session_id: &str, mode: &str) -> Arc<ResponseSlot> {
        let epoch = {
            let mut epochs = self.epochs.write().await;
            let epoch = epochs.entry(session_id.to_string()).or_insert(0);
            *epoch += 1;
            *epoch
        };

        let slot = Arc::new(ResponseSlot::new(ResponseMeta {
            response_id: response_id.to_string(),
            session_id: session_id.to_string(),
            mode: mode.to_string(),
            epoch,
        }));
        self.responses
            .write()
            .await
            .insert(response_id.to_string(), Arc::clone(&slot));
        debug!(response_id, session_id, epoch, "Response registered");
        slot
    }

    pub async fn get(&self, response_id: &str) -> Option<Arc<ResponseSlot>> {
        self.responses.read().await.get(response_id).cloned()
    }

    /// Append to a response log. Returns the assigned index, or `None` if the
    /// response is unknown or already sealed.
    pub async fn append(&self, response_id: &str, payload: EventPayload) -> Option<u64> {
        self.get(response_id).await?.append(payload).await
    }

    /// Buffered events with `idx >= start`.
    pub async fn events_from(&self, response_id: &str, start: u64) -> Option<Vec<RelayEvent>> {
        let slot = self.get(response_id).await?;
        Some(slot.events_from(start).await.0)
    }

    pub async fn mark_running(&self, response_id: &str) -> bool {
        match self.get(response_id).await {
            Some(slot) => slot.mark_running().await,
            None => false,
        }
    }

    pub async fn mark_terminal(
        &self,
        response_id: &str,
        status: ResponseStatus,
        error: Option<String>,
    ) -> bool {
        match self.get(response_id).await {
            Some(slot) => slot.mark_terminal(status, error).await,
            None => false,
        }
    }

    /// Status and full event log of a response.
    pub async fn snapshot(&self, response_id: &str) -> Option<StatusResponse> {
        Some(self.get(response_id).await?.snapshot().await)
    }

    /// Active (`pending`/`running`) responses, optionally for one session.
    pub async fn active_for_session(&self, session_id: Option<&str>) -> Vec<Arc<ResponseSlot>> {
        let slots: Vec<Arc<ResponseSlot>> = self
            .responses
            .read()
            .await
            .values()
            .filter(|slot| session_id.is_none_or(|s| slot.meta().session_id == s))
            .cloned()
            .collect();

        let mut active = Vec::new();
        for slot in slots {
            if slot.status().await.is_active() {
                active.push(slot);
            }
        }
        active.sort_by_key(|slot| slot.created_at());
        active
    }

    /// Active responses of every session in `mode`.
    pub async fn active_for_mode(&self, mode: &str) -> Vec<Arc<ResponseSlot>> {
        self.active_for_session(None)
            .await
            .into_iter()
            .filter(|slot| slot.meta().mode == mode)
            .collect()
    }

    /// Latest epoch assigned to a session.
    pub async fn current_epoch(&self, session_id: &str) -> Option<u64> {
        self.epochs.read().await.get(session_id).copied()
    }

    /// Remove terminal responses whose retention expired as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let slots: Vec<Arc<ResponseSlot>> =
            self.responses.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for slot in slots {
            if slot.expired(now, self.retention).await {
                expired.push(slot.meta().response_id.clone());
            }
        }
        if expired.is_empty() {
            return 0;
        }

        let mut responses = self.responses.write().await;
        for id in &expired {
            responses.remove(id);
        }
        drop(responses);
        info!(removed = expired.len(), "Swept expired responses");
        expired.len()
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// Number of responses held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.responses.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.responses.read().await.is_empty()
    }

    /// Run [`Self::sweep`] every `interval` until `shutdown` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Registry sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}
