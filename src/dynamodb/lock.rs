//! Conditional-update leader lock.
//!
//! The lock row carries a random identity and an expiry. Acquiring writes it
//! only if it is absent, already ours, or expired; the holder refreshes the
//! expiry periodically while a watcher re-reads the row and signals loss
//! once the identity changes or the row disappears.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::table::{DynamoTable, LockUpdate};
use crate::error::{PhysicalError, Result};
use crate::lock::{LeaderLost, Lock};

/// Intervals driving one lock handle.
#[derive(Debug, Clone, Copy)]
pub struct LockTimings {
    pub ttl: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
    pub watch_interval: Duration,
    /// Consecutive failed reads tolerated by the watcher.
    pub watch_retry_max: u32,
}

impl Default for LockTimings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
            watch_interval: Duration::from_secs(5),
            watch_retry_max: 5,
        }
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// A DynamoDB leader lock handle.
pub struct DynamoLock {
    table: Arc<dyn DynamoTable>,
    path: String,
    key: String,
    value: String,
    identity: String,
    timings: LockTimings,
    held: Mutex<Option<CancellationToken>>,
}

impl DynamoLock {
    pub(crate) fn new(
        table: Arc<dyn DynamoTable>,
        path: String,
        key: String,
        value: String,
        timings: LockTimings,
    ) -> Self {
        Self {
            table,
            path,
            key,
            value,
            identity: Uuid::new_v4().to_string(),
            timings,
            held: Mutex::new(None),
        }
    }

    fn update(&self, create_if_missing: bool) -> LockUpdate {
        let now = now_nanos();
        LockUpdate {
            path: self.path.clone(),
            key: self.key.clone(),
            value: self.value.as_bytes().to_vec(),
            identity: self.identity.as_bytes().to_vec(),
            now,
            expires: now + self.timings.ttl.as_nanos() as i64,
            create_if_missing,
        }
    }

    async fn acquire(&self, stop: &CancellationToken) -> Result<bool> {
        loop {
            if stop.is_cancelled() {
                return Ok(false);
            }
            if self.table.update_lock(&self.update(true)).await? {
                return Ok(true);
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.timings.retry_interval) => {}
            }
        }
    }

    fn spawn_renew(&self, lost: CancellationToken) {
        let table = self.table.clone();
        let path = self.path.clone();
        let key = self.key.clone();
        let template = self.update(false);
        let timings = self.timings;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lost.cancelled() => return,
                    _ = tokio::time::sleep(timings.renew_interval) => {}
                }
                let now = now_nanos();
                let update = LockUpdate {
                    now,
                    expires: now + timings.ttl.as_nanos() as i64,
                    ..template.clone()
                };
                // A failed condition means the row is gone; the watcher reports it.
                if let Err(e) = table.update_lock(&update).await {
                    error!(path = %path, key = %key, error = %e, "error renewing leadership lock");
                }
            }
        });
    }

    fn spawn_watch(&self, lost: CancellationToken) {
        let table = self.table.clone();
        let path = self.path.clone();
        let key = self.key.clone();
        let identity = self.identity.clone().into_bytes();
        let timings = self.timings;
        tokio::spawn(async move {
            let mut retries = timings.watch_retry_max;
            loop {
                tokio::select! {
                    _ = lost.cancelled() => return,
                    _ = tokio::time::sleep(timings.watch_interval) => {}
                }
                match table.get_item(&path, &key).await {
                    Ok(Some(item)) if item.identity.as_deref() == Some(identity.as_slice()) => {
                        retries = timings.watch_retry_max;
                    }
                    Ok(_) => {
                        info!(path = %path, key = %key, "dynamodb lock lost");
                        break;
                    }
                    Err(e) => {
                        retries = retries.saturating_sub(1);
                        warn!(path = %path, key = %key, error = %e, retries, "dynamodb lock watch failed");
                        if retries == 0 {
                            break;
                        }
                    }
                }
            }
            lost.cancel();
        });
    }
}

#[async_trait]
impl Lock for DynamoLock {
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

        if !self.acquire(&stop).await? {
            return Ok(None);
        }

        debug!(path = %self.path, key = %self.key, "dynamodb lock acquired");
        let lost = CancellationToken::new();
        self.spawn_renew(lost.clone());
        self.spawn_watch(lost.clone());
        *self.held.lock() = Some(lost.clone());
        Ok(Some(LeaderLost::new(lost)))
    }

    async fn unlock(&self) -> Result<()> {
        let Some(lost) = self.held.lock().take() else {
            return Ok(());
        };
        lost.cancel();
        // A failed condition means another holder already owns the row.
        self.table
            .delete_lock(&self.path, &self.key, self.identity.as_bytes())
            .await
            .map(|_| ())
    }

    async fn value(&self) -> Result<(bool, String)> {
        match self.table.get_item(&self.path, &self.key).await? {
            Some(item) if item.expires.map(|e| e > now_nanos()).unwrap_or(true) => {
                Ok((true, String::from_utf8_lossy(&item.value).into_owned()))
            }
            _ => Ok((false, String::new())),
        }
    }
}
