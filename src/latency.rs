//! Latency injection for fault testing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::store::{
    Backend, Entry, HaBackend, Purgeable, RedirectDetect, ServiceDiscovery, Transactional,
    TxnEntry,
};

pub const DEFAULT_JITTER_PERCENT: i64 = 20;

/// Sleeps before every operation, then delegates.
///
/// Each call waits `latency * (1 + r * jitter / 100)` with `r` drawn
/// uniformly from `[-1, 1]`.
pub struct LatencyInjector {
    inner: Arc<dyn Backend>,
    latency: Duration,
    jitter_percent: i64,
}

impl LatencyInjector {
    pub fn new(inner: Arc<dyn Backend>, latency: Duration, jitter_percent: i64) -> Self {
        let jitter_percent = if (0..=100).contains(&jitter_percent) {
            jitter_percent
        } else {
            warn!(jitter_percent, "jitter out of range, using default");
            DEFAULT_JITTER_PERCENT
        };
        info!(latency = ?latency, jitter_percent, "Creating latency injector");
        Self {
            inner,
            latency,
            jitter_percent,
        }
    }

    pub fn jitter_percent(&self) -> i64 {
        self.jitter_percent
    }

    fn next_delay(&self) -> Duration {
        if self.latency.is_zero() || self.jitter_percent == 0 {
            return self.latency;
        }
        let r: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        self.latency.mul_f64(1.0 + r * self.jitter_percent as f64 / 100.0)
    }

    async fn inject(&self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

#[async_trait]
impl Backend for LatencyInjector {
    async fn put(&self, entry: Entry) -> Result<()> {
        self.inject().await;
        self.inner.put(entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.inject().await;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inject().await;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inject().await;
        self.inner.list(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        self.inner.as_transactional().map(|_| self as &dyn Transactional)
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        self.inner.as_ha().map(|_| self as &dyn HaBackend)
    }

    fn as_service_discovery(&self) -> Option<&dyn ServiceDiscovery> {
        self.inner.as_service_discovery()
    }

    fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
        self.inner.as_redirect_detect()
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        self.inner.as_purgeable()
    }
}

#[async_trait]
impl Transactional for LatencyInjector {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let txn = self.inner.as_transactional().ok_or_else(|| {
            PhysicalError::Unsupported("inner backend does not support transactions".to_string())
        })?;
        self.inject().await;
        txn.transaction(txns).await
    }
}

impl HaBackend for LatencyInjector {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        match self.inner.as_ha() {
            Some(ha) => ha.lock_with(key, value),
            None => Err(PhysicalError::Unsupported("inner backend has no HA".to_string())),
        }
    }

    fn ha_enabled(&self) -> bool {
        self.inner.as_ha().is_some_and(|ha| ha.ha_enabled())
    }
}
