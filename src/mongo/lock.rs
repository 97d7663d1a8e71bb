//! Heartbeat leader lock.
//!
//! The holder owns a document in the lock collection and touches its
//! `lastCheckedIn` stamp every `refresh_interval`. Waiters poll: each round
//! first removes the document if its stamp is older than `ttl`, then tries
//! to create it. With `lock_on_primary` set, a node only contends while the
//! replica set primary is the named host and steps down once it moves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::collection::MongoStore;
use crate::error::{PhysicalError, Result};
use crate::lock::{LeaderLost, Lock};

/// Intervals driving one lock handle.
#[derive(Debug, Clone, Copy)]
pub struct MongoLockTimings {
    /// Age after which a lock document counts as abandoned.
    pub ttl: Duration,
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
}

impl MongoLockTimings {
    pub fn from_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            refresh_interval: ttl / 3,
            retry_interval: Duration::from_secs(1).min(ttl),
        }
    }
}

impl Default for MongoLockTimings {
    fn default() -> Self {
        Self::from_ttl(super::DEFAULT_LOCK_TTL)
    }
}

/// A MongoDB leader lock handle.
pub struct MongoLock {
    store: Arc<dyn MongoStore>,
    key: String,
    value: String,
    identity: String,
    lock_on_primary: Option<String>,
    timings: MongoLockTimings,
    held: Mutex<Option<CancellationToken>>,
}

impl MongoLock {
    pub(crate) fn new(
        store: Arc<dyn MongoStore>,
        key: String,
        value: String,
        lock_on_primary: Option<String>,
        timings: MongoLockTimings,
    ) -> Self {
        Self {
            store,
            key,
            value,
            identity: Uuid::new_v4().to_string(),
            lock_on_primary,
            timings,
            held: Mutex::new(None),
        }
    }

    /// Err when `lock_on_primary` names a host other than the current
    /// primary.
    async fn check_primary(&self) -> Result<()> {
        let Some(expected) = &self.lock_on_primary else {
            return Ok(());
        };
        let current = self.store.primary().await?.unwrap_or_default();
        if &current != expected {
            return Err(PhysicalError::NotReady(format!(
                "current MongoDB primary is {current:?}, not {expected:?}"
            )));
        }
        Ok(())
    }

    async fn try_acquire(&self) -> Result<bool> {
        if self.store.remove_stale_lock(&self.key, self.timings.ttl).await? {
            info!(key = %self.key, ttl = ?self.timings.ttl, "removed abandoned mongo lock");
        }
        self.store
            .acquire_lock(&self.key, &self.value, &self.identity)
            .await
    }

    async fn acquire(&self, stop: &CancellationToken) -> Result<bool> {
        loop {
            if stop.is_cancelled() {
                return Ok(false);
            }
            match self.check_primary().await {
                Ok(()) => match self.try_acquire().await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(key = %self.key, error = %e, "mongo lock attempt failed");
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => debug!(key = %self.key, reason = %e, "not contending for mongo lock"),
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.timings.retry_interval) => {}
            }
        }
    }

    /// Touch the lock while held; signal loss once it is gone, cannot be
    /// refreshed, or the primary moves away.
    fn spawn_refresh(&self, lost: CancellationToken) {
        let store = self.store.clone();
        let key = self.key.clone();
        let identity = self.identity.clone();
        let lock_on_primary = self.lock_on_primary.clone();
        let timings = self.timings;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lost.cancelled() => return,
                    _ = tokio::time::sleep(timings.refresh_interval) => {}
                }
                if let Some(expected) = &lock_on_primary {
                    match store.primary().await {
                        Ok(Some(current)) if &current == expected => {}
                        Ok(current) => {
                            info!(key = %key, primary = ?current, "MongoDB primary changed, dropping leadership");
                            break;
                        }
                        Err(e) => warn!(key = %key, error = %e, "could not read MongoDB primary"),
                    }
                }
                match store.refresh_lock(&key, &identity).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(key = %key, "mongo lock lost");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "mongo lock refresh failed, dropping leadership");
                        break;
                    }
                }
            }
            // Leave the document to expire if we could not reach the server.
            if let Err(e) = store.release_lock(&key, &identity).await {
                debug!(key = %key, error = %e, "mongo lock release after loss failed");
            }
            lost.cancel();
        });
    }
}

#[async_trait]
impl Lock for MongoLock {
    async fn lock(&self, stop: CancellationToken) -> Result<Option<LeaderLost>> {
        if stop.is_cancelled() {
            return Ok(None);
        }
        if self.held.lock().is_some() {
            return Err(PhysicalError::LockConflict {
                key: self.key.clone(),
                holder: self.value.clone(),
            });
        }
        self.check_primary().await?;

        if !self.acquire(&stop).await? {
            return Ok(None);
        }

        debug!(key = %self.key, "mongo lock acquired");
        let lost = CancellationToken::new();
        self.spawn_refresh(lost.clone());
        *self.held.lock() = Some(lost.clone());
        Ok(Some(LeaderLost::new(lost)))
    }

    async fn unlock(&self) -> Result<()> {
        let Some(lost) = self.held.lock().take() else {
            return Ok(());
        };
        lost.cancel();
        // False means the document already belongs to someone else.
        self.store
            .release_lock(&self.key, &self.identity)
            .await
            .map(|_| ())
    }

    async fn value(&self) -> Result<(bool, String)> {
        match self.store.lock_holder(&self.key).await? {
            Some(record) => Ok((true, record.value)),
            None => Ok((false, String::new())),
        }
    }
}
