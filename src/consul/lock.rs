//! Session-based leader lock.
//!
//! Acquisition creates a session with a TTL, renews it at half the TTL, and
//! takes the lock key with `?acquire=<session>`. A blocking query on the key
//! detects loss: the key vanishing or carrying another session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::ConsulApi;
use crate::error::{PhysicalError, Result};
use crate::lock::{LeaderLost, Lock};

/// Consecutive watch or renew failures tolerated before leadership is
/// considered lost.
const MAX_MONITOR_ERRORS: u32 = 5;
const MONITOR_RETRY: Duration = Duration::from_secs(1);

struct Held {
    session: String,
    /// Stops the renew and monitor tasks.
    tasks: CancellationToken,
    lost: CancellationToken,
}

/// A Consul leader lock handle.
pub struct ConsulLock {
    api: Arc<dyn ConsulApi>,
    key: String,
    value: String,
    session_ttl: Duration,
    lock_wait: Duration,
    held: Mutex<Option<Held>>,
}

impl ConsulLock {
    pub(crate) fn new(
        api: Arc<dyn ConsulApi>,
        key: String,
        value: String,
        session_ttl: Duration,
        lock_wait: Duration,
    ) -> Self {
        Self {
            api,
            key,
            value,
            session_ttl,
            lock_wait,
            held: Mutex::new(None),
        }
    }

    async fn delete_if_free(&self) -> Result<()> {
        if let Some(pair) = self.api.kv_get(&self.key).await? {
            if pair.session.is_none() {
                self.api.kv_delete_cas(&self.key, pair.modify_index).await?;
            }
        }
        Ok(())
    }

    /// Try until acquired; false if `stop` fired first.
    async fn acquire(&self, session: &str, stop: &CancellationToken) -> Result<bool> {
        let mut index = 0;
        loop {
            if stop.is_cancelled() {
                return Ok(false);
            }
            let free = match self.api.kv_get(&self.key).await? {
                Some(pair) => pair.session.is_none(),
                None => true,
            };
            if free
                && self
                    .api
                    .kv_acquire(&self.key, self.value.as_bytes(), session)
                    .await?
            {
                return Ok(true);
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(false),
                watched = self.api.kv_watch(&self.key, index, self.lock_wait) => {
                    index = watched?.1;
                }
            }
        }
    }
}

fn spawn_renew(
    api: Arc<dyn ConsulApi>,
    session: String,
    ttl: Duration,
    tasks: CancellationToken,
    lost: CancellationToken,
) {
    tokio::spawn(async move {
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = tasks.cancelled() => return,
                _ = tokio::time::sleep(ttl / 2) => {}
            }
            match api.session_renew(&session).await {
                Ok(true) => failures = 0,
                Ok(false) => {
                    warn!(session = %session, "consul session expired");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(session = %session, error = %e, failures, "failed to renew consul session");
                    if failures >= MAX_MONITOR_ERRORS {
                        lost.cancel();
                        return;
                    }
                }
            }
        }
    });
}

fn spawn_monitor(
    api: Arc<dyn ConsulApi>,
    key: String,
    session: String,
    wait: Duration,
    tasks: CancellationToken,
    lost: CancellationToken,
) {
    tokio::spawn(async move {
        let mut index = 0;
        let mut failures = 0;
        loop {
            let watched = tokio::select! {
                _ = tasks.cancelled() => return,
                watched = api.kv_watch(&key, index, wait) => watched,
            };
            match watched {
                Ok((pair, new_index)) => {
                    failures = 0;
                    index = new_index;
                    let ours = pair
                        .as_ref()
                        .and_then(|p| p.session.as_deref())
                        .map(|s| s == session)
                        .unwrap_or(false);
                    if !ours {
                        info!(key = %key, "consul lock lost");
                        lost.cancel();
                        return;
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(key = %key, error = %e, failures, "consul lock monitor failed");
                    if failures >= MAX_MONITOR_ERRORS {
                        lost.cancel();
                        return;
                    }
                    tokio::time::sleep(MONITOR_RETRY).await;
                }
            }
        }
    });
}

#[async_trait]
impl Lock for ConsulLock {
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

        let session = self.api.session_create("Vault Lock", self.session_ttl).await?;
        let tasks = CancellationToken::new();
        let lost = CancellationToken::new();
        spawn_renew(
            self.api.clone(),
            session.clone(),
            self.session_ttl,
            tasks.clone(),
            lost.clone(),
        );

        let acquired = match self.acquire(&session, &stop).await {
            Ok(acquired) => acquired,
            Err(e) => {
                tasks.cancel();
                if let Err(destroy) = self.api.session_destroy(&session).await {
                    warn!(session = %session, error = %destroy, "failed to destroy consul session after lock error");
                }
                return Err(e);
            }
        };
        if !acquired {
            tasks.cancel();
            if let Err(e) = self.api.session_destroy(&session).await {
                warn!(error = %e, "failed to destroy consul session");
            }
            return Ok(None);
        }

        debug!(key = %self.key, session = %session, "consul lock acquired");
        spawn_monitor(
            self.api.clone(),
            self.key.clone(),
            session.clone(),
            self.lock_wait,
            tasks.clone(),
            lost.clone(),
        );
        *self.held.lock() = Some(Held {
            session,
            tasks,
            lost: lost.clone(),
        });
        Ok(Some(LeaderLost::new(lost)))
    }

    async fn unlock(&self) -> Result<()> {
        let Some(held) = self.held.lock().take() else {
            return Ok(());
        };
        held.tasks.cancel();
        held.lost.cancel();

        let released = self.api.kv_release(&self.key, &held.session).await;
        // Clean up the record unless someone grabbed it in between.
        let cleaned = match released {
            Ok(true) => self.delete_if_free().await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        let destroyed = self.api.session_destroy(&held.session).await;
        if let Err(e) = &destroyed {
            warn!(session = %held.session, error = %e, "failed to destroy consul session");
        }
        cleaned.and(destroyed)
    }

    async fn value(&self) -> Result<(bool, String)> {
        match self.api.kv_get(&self.key).await? {
            Some(pair) if pair.session.is_some() => {
                Ok((true, String::from_utf8_lossy(&pair.value).into_owned()))
            }
            _ => Ok((false, String::new())),
        }
    }
}
