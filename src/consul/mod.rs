//! Consul backend: KV storage, session-based HA lock and service
//! registration.

pub mod api;
mod lock;
mod service;

#[cfg(test)]
pub(crate) mod fake;

pub use api::{ConsulApi, HttpConsul};
pub use lock::ConsulLock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::info;

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::permit::PermitPool;
use crate::store::{
    validate_key, Backend, Entry, HaBackend, Operation, RedirectDetect, ServiceDiscovery,
    Transactional, TxnEntry,
};
use crate::telemetry::measure;
use crate::util::list_segments;
use api::{KvTxnOp, KvVerb};

/// Largest value Consul accepts in one KV record.
pub const MAX_VALUE_SIZE: usize = 512 * 1024;

/// Most operations Consul accepts in one `/v1/txn` request.
pub const MAX_TXN_OPS: usize = 64;

/// KV flag marking a seal-wrapped entry.
const SEAL_WRAP_FLAG: u64 = 1;

const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";
const DEFAULT_PATH: &str = "vault/";
const DEFAULT_SERVICE: &str = "vault";
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15);
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(15);
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_CHECK_TIMEOUT: Duration = Duration::from_millis(100);

/// Settings for the service-discovery loop.
#[derive(Debug, Clone)]
pub(crate) struct ServiceSettings {
    pub name: String,
    pub tags: Vec<String>,
    pub address: Option<String>,
    pub disable_registration: bool,
    pub check_timeout: Duration,
}

/// Consul implementation of Backend.
pub struct ConsulBackend {
    api: Arc<dyn ConsulApi>,
    /// KV prefix for entries, always ending in '/'.
    path: String,
    /// KV prefix for lock records, disjoint from `path`.
    lock_path: String,
    permit_pool: PermitPool,
    ha_enabled: bool,
    session_ttl: Duration,
    lock_wait: Duration,
    service: ServiceSettings,
    state_changed: Arc<Notify>,
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

impl ConsulBackend {
    /// Build from configuration, talking HTTP to the configured agent.
    pub fn new(conf: &BackendConfig) -> Result<Self> {
        let address = conf
            .get_or_env("address", "CONSUL_HTTP_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let scheme = conf.get_or("scheme", "http");
        let token = conf.get_or_env("token", "CONSUL_HTTP_TOKEN");
        let datacenter = conf.get("datacenter").map(str::to_string);
        let api = HttpConsul::new(scheme, &address, token, datacenter)?;
        info!(address = %address, scheme, "Opening Consul backend");
        Self::with_api(Arc::new(api), conf)
    }

    /// Build over an existing API client.
    pub fn with_api(api: Arc<dyn ConsulApi>, conf: &BackendConfig) -> Result<Self> {
        let path = normalize_prefix(conf.get_or("path", DEFAULT_PATH));
        if path.is_empty() {
            return Err(PhysicalError::Config("'path' cannot be the KV root".into()));
        }
        let lock_path = match conf.get("lock_path") {
            Some(p) => normalize_prefix(p),
            None => format!("{}-locks/", path.trim_end_matches('/')),
        };
        if lock_path.starts_with(&path) || path.starts_with(&lock_path) {
            return Err(PhysicalError::Config(format!(
                "lock_path {lock_path:?} must not overlap path {path:?}"
            )));
        }

        let session_ttl = conf
            .parse_duration("session_ttl", DEFAULT_SESSION_TTL)?
            .max(MIN_SESSION_TTL);
        let lock_wait = conf.parse_duration("lock_wait_time", DEFAULT_LOCK_WAIT)?;
        let ha_enabled = match conf.get("ha_enabled") {
            Some(_) => conf.parse_bool("ha_enabled")?,
            None => true,
        };
        let service = ServiceSettings {
            name: conf.get_or("service", DEFAULT_SERVICE).to_string(),
            tags: conf
                .get("service_tags")
                .map(|t| {
                    t.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            address: conf.get("service_address").map(str::to_string),
            disable_registration: conf.parse_bool("disable_registration")?,
            check_timeout: conf
                .parse_duration("check_timeout", DEFAULT_CHECK_TIMEOUT)?
                .max(MIN_CHECK_TIMEOUT),
        };

        Ok(Self {
            api,
            path,
            lock_path,
            permit_pool: PermitPool::new(conf.max_parallel()?),
            ha_enabled,
            session_ttl,
            lock_wait,
            service,
            state_changed: Arc::new(Notify::new()),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.path, key)
    }

    fn check_entry(entry: &Entry) -> Result<()> {
        validate_key(&entry.key)?;
        if entry.value.len() > MAX_VALUE_SIZE {
            return Err(PhysicalError::too_large(
                &entry.key,
                entry.value.len(),
                MAX_VALUE_SIZE,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ConsulBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("consul", "put");
        Self::check_entry(&entry)?;
        let _permit = self.permit_pool.acquire().await?;

        let flags = if entry.seal_wrap { SEAL_WRAP_FLAG } else { 0 };
        self.api
            .kv_put(&self.full_key(&entry.key), &entry.value, flags)
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("consul", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let pair = self.api.kv_get(&self.full_key(key)).await?;
        Ok(pair.map(|pair| Entry {
            key: key.to_string(),
            value: pair.value,
            seal_wrap: pair.flags & SEAL_WRAP_FLAG != 0,
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("consul", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.api.kv_delete(&self.full_key(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("consul", "list");
        let _permit = self.permit_pool.acquire().await?;

        let full = self.full_key(prefix);
        let keys = self.api.kv_keys(&full).await?;
        Ok(list_segments(keys, &full))
    }

    async fn close(&self) -> Result<()> {
        self.permit_pool.close();
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }

    fn as_service_discovery(&self) -> Option<&dyn ServiceDiscovery> {
        Some(self)
    }

    fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for ConsulBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("consul", "transaction");
        if txns.len() > MAX_TXN_OPS {
            return Err(PhysicalError::TooManyStatements {
                count: txns.len(),
                limit: MAX_TXN_OPS,
            });
        }
        let mut ops = Vec::with_capacity(txns.len());
        for txn in txns {
            let op = match txn.operation {
                Operation::Put => {
                    Self::check_entry(&txn.entry)?;
                    KvTxnOp {
                        verb: KvVerb::Set,
                        key: self.full_key(&txn.entry.key),
                        flags: if txn.entry.seal_wrap { SEAL_WRAP_FLAG } else { 0 },
                        value: txn.entry.value,
                    }
                }
                Operation::Delete => {
                    validate_key(&txn.entry.key)?;
                    KvTxnOp {
                        verb: KvVerb::Delete,
                        key: self.full_key(&txn.entry.key),
                        value: Vec::new(),
                        flags: 0,
                    }
                }
                other => {
                    return Err(PhysicalError::Unsupported(format!(
                        "operation {other} is not allowed in a transaction"
                    )))
                }
            };
            ops.push(op);
        }
        if ops.is_empty() {
            return Ok(());
        }

        let _permit = self.permit_pool.acquire().await?;
        self.api.txn(&ops).await
    }
}

impl HaBackend for ConsulBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        validate_key(key)?;
        Ok(Box::new(ConsulLock::new(
            self.api.clone(),
            format!("{}{}", self.lock_path, key),
            value.to_string(),
            self.session_ttl,
            self.lock_wait,
        )))
    }

    fn ha_enabled(&self) -> bool {
        self.ha_enabled
    }
}

#[async_trait]
impl RedirectDetect for ConsulBackend {
    async fn detect_host_addr(&self) -> Result<String> {
        let info = self.api.agent_self().await?;
        info.pointer("/Member/Addr")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PhysicalError::Protocol("agent self has no Member.Addr".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        exercise_backend, exercise_backend_list_prefix, exercise_ha_backend,
        exercise_transactional_backend,
    };
    use fake::FakeConsul;

    fn backend(api: &Arc<FakeConsul>) -> ConsulBackend {
        ConsulBackend::with_api(api.clone(), &BackendConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_consul_conformance() {
        let api = Arc::new(FakeConsul::new());
        let b = backend(&api);
        exercise_backend(&b).await;
        exercise_backend_list_prefix(&b).await;
        exercise_transactional_backend(&b).await;
    }

    #[tokio::test]
    async fn test_consul_ha() {
        let api = Arc::new(FakeConsul::new());
        let a = backend(&api);
        let b = backend(&api);
        exercise_ha_backend(&a, &b).await;
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let api = Arc::new(FakeConsul::new());
        let b = backend(&api);
        b.put(Entry::new("foo/bar", b"x".to_vec()).sealed()).await.unwrap();

        let raw = api.raw("vault/foo/bar").unwrap();
        assert_eq!(raw.value, b"x");
        assert_eq!(raw.flags, SEAL_WRAP_FLAG);
        assert!(b.get("foo/bar").await.unwrap().unwrap().seal_wrap);
    }

    #[tokio::test]
    async fn test_lock_records_hidden_from_list() {
        let api = Arc::new(FakeConsul::new());
        let b = backend(&api);
        let lock = b.lock_with("core/lock", "node-a").unwrap();
        lock.lock(tokio_util::sync::CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(api.raw("vault-locks/core/lock").is_some());
        assert!(b.list("").await.unwrap().is_empty());
        lock.unlock().await.unwrap();
        assert!(api.raw("vault-locks/core/lock").is_none());
    }

    #[tokio::test]
    async fn test_too_large() {
        let api = Arc::new(FakeConsul::new());
        let b = backend(&api);
        let err = b
            .put(Entry::new("big", vec![0u8; MAX_VALUE_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, PhysicalError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_too_many_statements() {
        let api = Arc::new(FakeConsul::new());
        let b = backend(&api);
        let txns = (0..=MAX_TXN_OPS)
            .map(|i| TxnEntry::put(Entry::new(format!("k{i}"), b"v".to_vec())))
            .collect();
        let err = b.transaction(txns).await.unwrap_err();
        assert!(matches!(
            err,
            PhysicalError::TooManyStatements { count: 65, limit: 64 }
        ));
    }

    #[tokio::test]
    async fn test_detect_host_addr() {
        let api = Arc::new(FakeConsul::new());
        let b = backend(&api);
        assert_eq!(b.detect_host_addr().await.unwrap(), "10.0.0.5");
    }

    #[test]
    fn test_path_config() {
        let api: Arc<dyn ConsulApi> = Arc::new(FakeConsul::new());
        let conf = BackendConfig::from([("path", "/secrets")]);
        let b = ConsulBackend::with_api(api.clone(), &conf).unwrap();
        assert_eq!(b.path, "secrets/");
        assert_eq!(b.lock_path, "secrets-locks/");

        let conf = BackendConfig::from([("path", "a/"), ("lock_path", "a/locks")]);
        assert!(ConsulBackend::with_api(api.clone(), &conf).is_err());

        let conf = BackendConfig::from([("ha_enabled", "false")]);
        let b = ConsulBackend::with_api(api, &conf).unwrap();
        assert!(!b.capabilities().ha);
    }
}
