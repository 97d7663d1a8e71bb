//! Lease-backed leader lock.
//!
//! The lock record is created only if absent and is attached to a lease kept
//! alive in the background. Revoking or losing the lease deletes the record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::EtcdKv;
use crate::error::{PhysicalError, Result};
use crate::lock::{LeaderLost, Lock};

const ACQUIRE_RETRY: Duration = Duration::from_millis(500);
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);
const MAX_MONITOR_ERRORS: u32 = 5;

struct Held {
    lease: i64,
    tasks: CancellationToken,
    lost: CancellationToken,
}

/// An etcd leader lock handle.
pub struct EtcdLock {
    client: Arc<dyn EtcdKv>,
    key: String,
    value: String,
    ttl: Duration,
    held: Mutex<Option<Held>>,
}

impl EtcdLock {
    pub(crate) fn new(client: Arc<dyn EtcdKv>, key: String, value: String, ttl: Duration) -> Self {
        Self {
            client,
            key,
            value,
            ttl,
            held: Mutex::new(None),
        }
    }

    async fn acquire(&self, lease: i64, stop: &CancellationToken) -> Result<bool> {
        loop {
            if stop.is_cancelled() {
                return Ok(false);
            }
            if self
                .client
                .create_if_absent(&self.key, self.value.as_bytes(), lease)
                .await?
            {
                return Ok(true);
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(false),
                _ = tokio::time::sleep(ACQUIRE_RETRY) => {}
            }
        }
    }
}

fn spawn_keep_alive(
    client: Arc<dyn EtcdKv>,
    lease: i64,
    ttl: Duration,
    tasks: CancellationToken,
    lost: CancellationToken,
) {
    tokio::spawn(async move {
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = tasks.cancelled() => return,
                _ = tokio::time::sleep(ttl / 3) => {}
            }
            match client.lease_keep_alive(lease).await {
                Ok(true) => failures = 0,
                Ok(false) => {
                    warn!(lease, "etcd lease expired");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(lease, error = %e, failures, "failed to refresh etcd lease");
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
    client: Arc<dyn EtcdKv>,
    key: String,
    lease: i64,
    tasks: CancellationToken,
    lost: CancellationToken,
) {
    tokio::spawn(async move {
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = tasks.cancelled() => return,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
            match client.get(&key).await {
                Ok(Some(kv)) if kv.lease == lease => failures = 0,
                Ok(_) => {
                    info!(key = %key, "etcd lock lost");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(key = %key, error = %e, failures, "etcd lock monitor failed");
                    if failures >= MAX_MONITOR_ERRORS {
                        lost.cancel();
                        return;
                    }
                }
            }
        }
    });
}

#[async_trait]
impl Lock for EtcdLock {
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

        let lease = self.client.lease_grant(self.ttl).await?;
        let tasks = CancellationToken::new();
        let lost = CancellationToken::new();
        spawn_keep_alive(self.client.clone(), lease, self.ttl, tasks.clone(), lost.clone());

        let acquired = self.acquire(lease, &stop).await;
        if !matches!(acquired, Ok(true)) {
            tasks.cancel();
            if let Err(e) = self.client.lease_revoke(lease).await {
                warn!(lease, error = %e, "failed to revoke etcd lease");
            }
            return acquired.map(|_| None);
        }

        debug!(key = %self.key, lease, "etcd lock acquired");
        spawn_monitor(self.client.clone(), self.key.clone(), lease, tasks.clone(), lost.clone());
        *self.held.lock() = Some(Held {
            lease,
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

        self.client.delete_if_lease(&self.key, held.lease).await?;
        self.client.lease_revoke(held.lease).await
    }

    async fn value(&self) -> Result<(bool, String)> {
        match self.client.get(&self.key).await? {
            Some(kv) => Ok((true, String::from_utf8_lossy(&kv.value).into_owned())),
            None => Ok((false, String::new())),
        }
    }
}
