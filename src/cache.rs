//! Read-through cache decorator.
//!
//! A two-queue LRU sits in front of any backend. Writes update the cache
//! under a per-key lock before returning; `list` always goes to the inner
//! backend. Keys under `core/` are not cached unless an exception says so.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::store::{
    Backend, Entry, HaBackend, Operation, Purgeable, RedirectDetect, ServiceDiscovery,
    Transactional, TxnEntry,
};

/// Entries held when no positive size is configured.
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024;
/// Number of per-key locks; a power of two.
const LOCK_COUNT: usize = 256;
/// Keys under this root are uncached by default.
const CORE_ROOT: &str = "core/";

const RECENT_RATIO: f64 = 0.25;
const GHOST_RATIO: f64 = 0.50;

fn non_zero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Two-queue LRU: entries seen once live in `recent`, entries hit again are
/// promoted to `frequent`, and keys evicted from `recent` are remembered in
/// `ghost` so a quick return goes straight to `frequent`.
struct TwoQueue {
    size: usize,
    recent_target: usize,
    recent: LruCache<String, Entry>,
    frequent: LruCache<String, Entry>,
    ghost: LruCache<String, ()>,
}

impl TwoQueue {
    fn new(size: usize) -> Self {
        let recent_target = (size as f64 * RECENT_RATIO) as usize;
        let ghost_size = (size as f64 * GHOST_RATIO) as usize;
        Self {
            size,
            recent_target,
            recent: LruCache::new(non_zero(size)),
            frequent: LruCache::new(non_zero(size)),
            ghost: LruCache::new(non_zero(ghost_size)),
        }
    }

    fn get(&mut self, key: &str) -> Option<Entry> {
        if let Some(entry) = self.frequent.get(key) {
            return Some(entry.clone());
        }
        let (key, entry) = self.recent.pop_entry(key)?;
        self.frequent.put(key, entry.clone());
        Some(entry)
    }

    fn add(&mut self, entry: Entry) {
        let key = entry.key.clone();
        if self.frequent.contains(&key) {
            self.frequent.put(key, entry);
            return;
        }
        if self.recent.pop(&key).is_some() {
            self.frequent.put(key, entry);
            return;
        }
        if self.ghost.pop(&key).is_some() {
            self.ensure_space(true);
            self.frequent.put(key, entry);
            return;
        }
        self.ensure_space(false);
        self.recent.put(key, entry);
    }

    fn ensure_space(&mut self, ghost_hit: bool) {
        if self.recent.len() + self.frequent.len() < self.size {
            return;
        }
        let recent = self.recent.len();
        if recent > 0 && (recent > self.recent_target || (recent == self.recent_target && !ghost_hit)) {
            if let Some((key, _)) = self.recent.pop_lru() {
                self.ghost.put(key, ());
            }
            return;
        }
        self.frequent.pop_lru();
    }

    fn remove(&mut self, key: &str) {
        self.frequent.pop(key);
        self.recent.pop(key);
        self.ghost.pop(key);
    }

    fn len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }

    fn purge(&mut self) {
        self.recent.clear();
        self.frequent.clear();
        self.ghost.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheRule {
    path: String,
    prefix: bool,
    cache: bool,
}

/// Which keys are cached.
///
/// The most specific matching rule wins: a longer path beats a shorter one
/// and an exact rule beats a prefix rule of the same length. Rules ending in
/// '/' match by prefix, others match one key. A leading '!' marks a path as
/// uncached.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    rules: Vec<CacheRule>,
}

impl CachePolicy {
    pub fn new(exceptions: &[String]) -> Self {
        let mut rules = vec![CacheRule {
            path: CORE_ROOT.to_string(),
            prefix: true,
            cache: false,
        }];
        for raw in exceptions {
            let raw = raw.trim();
            let (cache, path) = match raw.strip_prefix('!') {
                Some(path) => (false, path),
                None => (true, raw),
            };
            if path.is_empty() {
                continue;
            }
            rules.push(CacheRule {
                path: path.to_string(),
                prefix: path.ends_with('/'),
                cache,
            });
        }
        Self { rules }
    }

    pub fn should_cache(&self, key: &str) -> bool {
        self.rules
            .iter()
            .filter(|r| {
                if r.prefix {
                    key.starts_with(&r.path)
                } else {
                    key == r.path
                }
            })
            .max_by_key(|r| (r.path.len(), !r.prefix))
            .map_or(true, |r| r.cache)
    }
}

/// Caching decorator over any backend.
pub struct Cache {
    inner: Arc<dyn Backend>,
    lru: Mutex<TwoQueue>,
    locks: Vec<RwLock<()>>,
    policy: CachePolicy,
    enabled: AtomicBool,
}

impl Cache {
    /// Wrap `inner`. A size of zero or less selects [`DEFAULT_CACHE_SIZE`].
    pub fn new(inner: Arc<dyn Backend>, size: i64, exceptions: &[String]) -> Self {
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_CACHE_SIZE);
        info!(size, exceptions = exceptions.len(), "Creating physical cache");
        Self {
            inner,
            lru: Mutex::new(TwoQueue::new(size)),
            locks: (0..LOCK_COUNT).map(|_| RwLock::new(())).collect(),
            policy: CachePolicy::new(exceptions),
            enabled: AtomicBool::new(true),
        }
    }

    /// Turn caching on or off at runtime. Disabling also empties the cache.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.lru.lock().purge();
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn should_cache(&self, key: &str) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.policy.should_cache(key)
    }

    fn lock_index(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (LOCK_COUNT - 1)
    }

    fn lock_for(&self, key: &str) -> &RwLock<()> {
        &self.locks[Self::lock_index(key)]
    }
}

#[async_trait]
impl Backend for Cache {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _guard = self.lock_for(&entry.key).write().await;
        self.inner.put(entry.clone()).await?;
        if self.should_cache(&entry.key) {
            self.lru.lock().add(entry);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _guard = self.lock_for(key).read().await;
        let cacheable = self.should_cache(key);
        if cacheable {
            let cached = self.lru.lock().get(key);
            if cached.is_some() {
                return Ok(cached);
            }
        }

        let entry = self.inner.get(key).await?;
        if cacheable {
            if let Some(entry) = &entry {
                self.lru.lock().add(entry.clone());
            }
        }
        Ok(entry)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock_for(key).write().await;
        self.inner.delete(key).await?;
        if self.should_cache(key) {
            self.lru.lock().remove(key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.lru.lock().purge();
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
        Some(self)
    }
}

#[async_trait]
impl Transactional for Cache {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let txn = self.inner.as_transactional().ok_or_else(|| {
            PhysicalError::Unsupported("inner backend does not support transactions".to_string())
        })?;

        // Lock in index order so overlapping transactions cannot deadlock.
        let mut indexes: Vec<usize> = txns.iter().map(|t| Self::lock_index(t.key())).collect();
        indexes.sort_unstable();
        indexes.dedup();
        let mut guards = Vec::with_capacity(indexes.len());
        for index in indexes {
            guards.push(self.locks[index].write().await);
        }

        txn.transaction(txns.clone()).await?;

        let mut lru = self.lru.lock();
        for t in txns {
            if !self.should_cache(t.key()) {
                continue;
            }
            match t.operation {
                Operation::Put => lru.add(t.entry),
                Operation::Delete => lru.remove(&t.entry.key),
                _ => {}
            }
        }
        Ok(())
    }
}

impl HaBackend for Cache {
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

#[async_trait]
impl Purgeable for Cache {
    async fn purge(&self) {
        let mut guards = Vec::with_capacity(self.locks.len());
        for lock in &self.locks {
            guards.push(lock.write().await);
        }
        self.lru.lock().purge();
        debug!("physical cache purged");
    }
}
