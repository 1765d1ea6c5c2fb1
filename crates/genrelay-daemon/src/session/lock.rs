//! Session lock table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{Holder, LockError, LockGrant, LockToken};

/// Lock table keyed by session id.
///
/// A lease is an inactivity timeout: the holder renews it while its process
/// makes progress. An acquire that finds an expired lease reclaims the lock
/// and reports the evicted response.
#[derive(Debug)]
pub struct SessionLocks {
    held: Mutex<HashMap<String, Holder>>,
    released: Notify,
    next_token: AtomicU64,
    /// How long `acquire` waits for a busy session before giving up.
    wait: Duration,
}

impl SessionLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_token: AtomicU64::new(1),
            wait,
        }
    }

    /// Acquire the lock for `session_id` on behalf of `response_id`.
    ///
    /// Fails with [`LockError::Busy`] if a live holder exists and no release
    /// happens within the configured wait.
    pub async fn acquire(
        &self,
        session_id: &str,
        response_id: &str,
        lease: Duration,
    ) -> Result<LockGrant, LockError> {
        let deadline = Instant::now() + self.wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self
                .try_acquire_at(session_id, response_id, lease, Instant::now())
                .await
            {
                Err(LockError::Busy { .. }) if Instant::now() < deadline => {}
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self
                    .try_acquire_at(session_id, response_id, lease, Instant::now())
                    .await;
            }
        }
    }

    /// Single acquire attempt as of `now`.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn try_acquire_at(
        &self,
        session_id: &str,
        response_id: &str,
        lease: Duration,
        now: Instant,
    ) -> Result<LockGrant, LockError> {
        let mut held = self.held.lock().await;

        let evicted = match held.get(session_id) {
            Some(holder) if holder.is_live(now) => {
                debug!(session_id, holder = %holder.response_id, "Session lock busy");
                return Err(LockError::Busy {
                    session_id: session_id.to_string(),
                    response_id: holder.response_id.clone(),
                });
            }
            Some(stale) => {
                warn!(
                    session_id,
                    evicted = %stale.response_id,
                    held_for = ?now.saturating_duration_since(stale.acquired_at),
                    "Reclaiming session lock with expired lease"
                );
                Some(stale.response_id.clone())
            }
            None => None,
        };

        let token_id = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(
            session_id.to_string(),
            Holder {
                token_id,
                response_id: response_id.to_string(),
                acquired_at: now,
                renewed_at: now,
                lease,
            },
        );
        info!(session_id, response_id, "Session lock acquired");

        Ok(LockGrant {
            token: LockToken {
                session_id: session_id.to_string(),
                id: token_id,
            },
            evicted,
        })
    }

    /// Extend the lease. Returns `false` if the token no longer holds the lock.
    pub async fn renew(&self, token: &LockToken) -> bool {
        self.renew_at(token, Instant::now()).await
    }

    pub async fn renew_at(&self, token: &LockToken, now: Instant) -> bool {
        let mut held = self.held.lock().await;
        match held.get_mut(&token.session_id) {
            Some(holder) if holder.token_id == token.id => {
                holder.renewed_at = now;
                true
            }
            _ => false,
        }
    }

    /// Release the lock if `token` still holds it. Idempotent.
    pub async fn release(&self, token: &LockToken) -> bool {
        let mut held = self.held.lock().await;
        let matches = held
            .get(&token.session_id)
            .is_some_and(|holder| holder.token_id == token.id);
        if matches {
            held.remove(&token.session_id);
            drop(held);
            info!(session_id = %token.session_id, "Session lock released");
            self.released.notify_waiters();
        }
        matches
    }

    /// Response currently holding the session, if any.
    pub async fn holder(&self, session_id: &str) -> Option<String> {
        self.held
            .lock()
            .await
            .get(session_id)
            .map(|h| h.response_id.clone())
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn second_acquire_is_busy() {
        let locks = SessionLocks::default();
        let grant = locks.acquire("chat_a", "r1", LEASE).await.unwrap();
        assert!(grant.evicted.is_none());

        let err = locks.acquire("chat_a", "r2", LEASE).await.unwrap_err();
        assert!(matches!(err, LockError::Busy { ref response_id, .. } if response_id == "r1"));

        locks.acquire("chat_b", "r3", LEASE).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent_and_token_checked() {
        let locks = SessionLocks::default();
        let first = locks.acquire("s", "r1", LEASE).await.unwrap();
        assert!(locks.release(&first.token).await);
        assert!(!locks.release(&first.token).await);

        let second = locks.acquire("s", "r2", LEASE).await.unwrap();
        assert!(!locks.release(&first.token).await);
        assert_eq!(locks.holder("s").await.as_deref(), Some("r2"));
        assert!(locks.release(&second.token).await);
        assert!(locks.holder("s").await.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let locks = SessionLocks::default();
        let start = Instant::now();
        let stale = locks
            .try_acquire_at("s", "r1", LEASE, start)
            .await
            .unwrap();

        let later = start + LEASE + Duration::from_secs(1);
        let grant = locks.try_acquire_at("s", "r2", LEASE, later).await.unwrap();
        assert_eq!(grant.evicted.as_deref(), Some("r1"));
        assert!(!locks.release(&stale.token).await);
        assert!(!locks.renew(&stale.token).await);
    }

    #[tokio::test]
    async fn renewal_keeps_lease_alive() {
        let locks = SessionLocks::default();
        let start = Instant::now();
        let grant = locks.try_acquire_at("s", "r1", LEASE, start).await.unwrap();

        let renewed = start + Duration::from_secs(100);
        assert!(locks.renew_at(&grant.token, renewed).await);

        let probe = start + Duration::from_secs(200);
        assert!(locks.try_acquire_at("s", "r2", LEASE, probe).await.is_err());
    }

    #[tokio::test]
    async fn bounded_wait_picks_up_release() {
        let locks = Arc::new(SessionLocks::new(Duration::from_secs(5)));
        let grant = locks.acquire("s", "r1", LEASE).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("s", "r2", LEASE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&grant.token).await;

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.token.session_id(), "s");
        assert_eq!(locks.holder("s").await.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let locks = SessionLocks::new(Duration::from_millis(30));
        locks.acquire("s", "r1", LEASE).await.unwrap();
        assert!(locks.acquire("s", "r2", LEASE).await.is_err());
    }
}
