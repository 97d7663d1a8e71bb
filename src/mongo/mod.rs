//! MongoDB backend.
//!
//! One document per entry in the data collection, keyed by the full path
//! under a unique index; a list is a prefix regex over `key`. Leader locks
//! live in their own collection (see [`lock`]).

pub mod collection;
mod lock;

#[cfg(test)]
pub(crate) mod fake;

pub use collection::{LockRecord, MongoCollection, MongoStore};
pub use lock::{MongoLock, MongoLockTimings};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, HaBackend};
use crate::telemetry::measure;

pub const DEFAULT_URL: &str = "mongodb://127.0.0.1:27017/vault";
pub const DEFAULT_DATABASE: &str = "vault";
pub const DEFAULT_COLLECTION: &str = "vault";
pub const DEFAULT_LOCK_COLLECTION: &str = "vault_lock";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5);

/// Parsed driver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MongoSettings {
    pub url: String,
    /// Falls back to the database named in `url`.
    pub database: Option<String>,
    pub collection: String,
    pub lock_collection: String,
    pub ha_enabled: bool,
    /// Only contend for leadership while this host is the primary.
    pub lock_on_primary: Option<String>,
    pub lock_ttl: Duration,
    pub tls: bool,
    pub tls_skip_verify: bool,
    pub tls_ca_file: Option<String>,
    /// PEM holding both the client certificate and its key.
    pub tls_cert_file: Option<String>,
    pub max_parallel: usize,
}

impl MongoSettings {
    pub fn from_config(conf: &BackendConfig) -> Result<Self> {
        let tls_cert_file = conf.get("tls_cert_file").map(str::to_string);
        if let Some(key_file) = conf.get("tls_key_file") {
            if tls_cert_file.as_deref() != Some(key_file) {
                return Err(PhysicalError::Config(
                    "mongo: tls_key_file must be the same PEM as tls_cert_file, holding both certificate and key".into(),
                ));
            }
        }
        let tls_ca_file = conf.get("tls_ca_file").map(str::to_string);
        let tls_skip_verify = conf.parse_bool("tls_skip_verify")?;
        Ok(Self {
            url: conf.get_or("url", DEFAULT_URL).to_string(),
            database: conf.get("database").filter(|d| !d.is_empty()).map(str::to_string),
            collection: conf.get_or("collection", DEFAULT_COLLECTION).to_string(),
            lock_collection: conf
                .get_or("collection_ha_lock", DEFAULT_LOCK_COLLECTION)
                .to_string(),
            ha_enabled: conf.parse_bool("ha_enabled")?,
            lock_on_primary: conf
                .get("lock_on_primary")
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            lock_ttl: conf.parse_duration("lock_ttl", DEFAULT_LOCK_TTL)?,
            // Any TLS file or option turns TLS on.
            tls: conf.parse_bool("tls")?
                || tls_skip_verify
                || tls_ca_file.is_some()
                || tls_cert_file.is_some(),
            tls_skip_verify,
            tls_ca_file,
            tls_cert_file,
            max_parallel: conf.max_parallel()?,
        })
    }
}

/// MongoDB implementation of Backend.
pub struct MongoBackend {
    store: Arc<dyn MongoStore>,
    permit_pool: PermitPool,
    ha_enabled: bool,
    lock_on_primary: Option<String>,
    lock_timings: MongoLockTimings,
}

impl MongoBackend {
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let settings = MongoSettings::from_config(conf)?;
        let store = MongoCollection::connect(&settings).await?;
        info!(ha_enabled = settings.ha_enabled, lock_on_primary = ?settings.lock_on_primary, "Opened MongoDB backend");
        Ok(Self::with_store(Arc::new(store), &settings))
    }

    pub fn with_store(store: Arc<dyn MongoStore>, settings: &MongoSettings) -> Self {
        Self {
            store,
            permit_pool: PermitPool::new(settings.max_parallel),
            ha_enabled: settings.ha_enabled,
            lock_on_primary: settings.lock_on_primary.clone(),
            lock_timings: MongoLockTimings::from_ttl(settings.lock_ttl),
        }
    }

    /// Override lock intervals, mainly for tests.
    pub fn with_lock_timings(mut self, timings: MongoLockTimings) -> Self {
        self.lock_timings = timings;
        self
    }
}

/// First segment of each key below `prefix`, folders suffixed with '/'.
fn children(prefix: &str, keys: &[String]) -> Vec<String> {
    let mut names: Vec<String> = keys
        .iter()
        .filter_map(|key| key.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .map(|rest| match rest.find('/') {
            Some(i) => rest[..=i].to_string(),
            None => rest.to_string(),
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

#[async_trait]
impl Backend for MongoBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("mongo", "put");
        validate_key(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.store.upsert(&entry.key, &entry.value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("mongo", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        Ok(self.store.find(key).await?.map(|value| Entry::new(key, value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("mongo", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.store.remove(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("mongo", "list");
        let _permit = self.permit_pool.acquire().await?;

        let keys = self.store.keys_with_prefix(prefix).await?;
        let names = children(prefix, &keys);
        debug!(prefix, count = names.len(), "mongo list");
        Ok(names)
    }

    async fn close(&self) -> Result<()> {
        self.permit_pool.close();
        Ok(())
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }
}

impl HaBackend for MongoBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        validate_key(key)?;
        Ok(Box::new(MongoLock::new(
            self.store.clone(),
            key.to_string(),
            value.to_string(),
            self.lock_on_primary.clone(),
            self.lock_timings,
        )))
    }

    fn ha_enabled(&self) -> bool {
        self.ha_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{exercise_backend, exercise_backend_list_prefix, exercise_ha_backend};
    use fake::FakeMongo;
    use tokio_util::sync::CancellationToken;

    fn settings() -> MongoSettings {
        MongoSettings::from_config(&BackendConfig::from([("ha_enabled", "true")])).unwrap()
    }

    fn fast() -> MongoLockTimings {
        MongoLockTimings {
            ttl: Duration::from_millis(300),
            refresh_interval: Duration::from_millis(50),
            retry_interval: Duration::from_millis(50),
        }
    }

    fn backend(store: &Arc<FakeMongo>) -> MongoBackend {
        MongoBackend::with_store(store.clone(), &settings()).with_lock_timings(fast())
    }

    #[tokio::test]
    async fn test_mongo_conformance() {
        let store = Arc::new(FakeMongo::new());
        let b = backend(&store);
        exercise_backend(&b).await;
        exercise_backend_list_prefix(&b).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_mongo_ha() {
        let store = Arc::new(FakeMongo::new());
        exercise_ha_backend(&backend(&store), &backend(&store)).await;
    }

    #[tokio::test]
    async fn test_locks_kept_out_of_data() {
        let store = Arc::new(FakeMongo::new());
        let b = backend(&store);
        b.put(Entry::new("core/data", b"1".to_vec())).await.unwrap();

        let lock = b.lock_with("core/lock", "node-a").unwrap();
        lock.lock(CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(store.lock_doc("core/lock").unwrap().value, "node-a");
        assert_eq!(b.list("core/").await.unwrap(), vec!["data"]);

        lock.unlock().await.unwrap();
        assert!(store.lock_doc("core/lock").is_none());
    }

    #[tokio::test]
    async fn test_abandoned_lock_removed() {
        let store = Arc::new(FakeMongo::new());
        let a = backend(&store);
        let b = backend(&store);

        let lock_a = a.lock_with("leader", "alice").unwrap();
        let lost_a = lock_a.lock(CancellationToken::new()).await.unwrap().unwrap();

        // alice stops refreshing once the server is unreachable.
        store.set_offline(true);
        tokio::time::timeout(Duration::from_secs(5), lost_a.lost())
            .await
            .expect("alice steps down when refresh fails");
        store.set_offline(false);
        assert!(store.lock_doc("leader").is_some(), "document left to expire");

        let lock_b = b.lock_with("leader", "bob").unwrap();
        let _leader_b = tokio::time::timeout(Duration::from_secs(5), lock_b.lock(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lock_b.value().await.unwrap(), (true, "bob".to_string()));

        // alice's unlock must not remove bob's document.
        lock_a.unlock().await.unwrap();
        assert_eq!(store.lock_doc("leader").unwrap().value, "bob");
        lock_b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_on_primary() {
        let store = Arc::new(FakeMongo::new());
        let conf = BackendConfig::from([("ha_enabled", "true"), ("lock_on_primary", "mongo-0:27017")]);
        let settings = MongoSettings::from_config(&conf).unwrap();
        let b = MongoBackend::with_store(store.clone(), &settings).with_lock_timings(fast());

        let lock = b.lock_with("leader", "alice").unwrap();
        let lost = lock.lock(CancellationToken::new()).await.unwrap().unwrap();

        store.set_primary("mongo-1:27017");
        tokio::time::timeout(Duration::from_secs(5), lost.lost())
            .await
            .expect("leadership dropped when the primary moves");
        assert!(store.lock_doc("leader").is_none());

        let err = lock.lock(CancellationToken::new()).await;
        // The handle still counts as held until unlock.
        assert!(err.is_err());
        lock.unlock().await.unwrap();
        let err = lock.lock(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotReady);
    }

    #[test]
    fn test_children() {
        let keys: Vec<String> = ["a", "a/b", "a/c/d", "ab", "b"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(children("", &keys), vec!["a", "a/", "ab", "b"]);
        assert_eq!(children("a/", &keys), vec!["b", "c/"]);
        assert_eq!(children("a", &keys), vec!["/", "b"]);
    }

    #[test]
    fn test_settings() {
        let s = MongoSettings::from_config(&BackendConfig::default()).unwrap();
        assert_eq!(s.url, DEFAULT_URL);
        assert_eq!(s.collection, DEFAULT_COLLECTION);
        assert_eq!(s.lock_collection, DEFAULT_LOCK_COLLECTION);
        assert_eq!(s.lock_ttl, DEFAULT_LOCK_TTL);
        assert!(!s.ha_enabled && !s.tls);

        let s = MongoSettings::from_config(&BackendConfig::from([
            ("tls_ca_file", "/etc/ca.pem"),
            ("lock_ttl", "10s"),
            ("database", "secrets"),
        ]))
        .unwrap();
        assert!(s.tls);
        assert_eq!(s.lock_ttl, Duration::from_secs(10));
        assert_eq!(s.database.as_deref(), Some("secrets"));

        let split = BackendConfig::from([("tls_cert_file", "/c.pem"), ("tls_key_file", "/k.pem")]);
        assert!(matches!(
            MongoSettings::from_config(&split),
            Err(PhysicalError::Config(_))
        ));
    }
}
