//! etcd v3 backend.
//!
//! Entries live under a key prefix; listing is a keys-only range scan folded
//! at '/'. The optional HA lock is a lease-attached key created with a
//! `create_revision == 0` transaction.

pub mod client;
mod lock;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{EtcdKv, HttpEtcd};
pub use lock::EtcdLock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, HaBackend, Operation, Transactional, TxnEntry};
use crate::telemetry::measure;
use crate::util::list_segments;
use client::TxnOp;

/// Default cap on operations per etcd transaction (`--max-txn-ops`).
pub const MAX_TXN_OPS: usize = 128;

const DEFAULT_ADDRESS: &str = "http://127.0.0.1:2379";
const DEFAULT_PATH: &str = "/vault/";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// etcd implementation of Backend.
pub struct EtcdBackend {
    client: Arc<dyn EtcdKv>,
    path: String,
    lock_path: String,
    permit_pool: PermitPool,
    ha_enabled: bool,
    lock_ttl: Duration,
}

impl EtcdBackend {
    pub fn new(conf: &BackendConfig) -> Result<Self> {
        check_api_version(conf.get("etcd_api"))?;
        let addresses: Vec<String> = conf
            .get_or_env("address", "ETCD_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let credentials = match (
            conf.get_or_env("username", "ETCD_USERNAME"),
            conf.get_or_env("password", "ETCD_PASSWORD"),
        ) {
            (Some(user), Some(pass)) => Some((user, pass)),
            (None, None) => None,
            _ => {
                return Err(PhysicalError::Config(
                    "both 'username' and 'password' must be set".into(),
                ))
            }
        };
        let timeout = conf.parse_duration("request_timeout", DEFAULT_REQUEST_TIMEOUT)?;
        let client = HttpEtcd::new(&addresses, credentials, timeout)?;
        info!(endpoints = ?addresses, "Opening etcd backend");
        Self::with_client(Arc::new(client), conf)
    }

    pub fn with_client(client: Arc<dyn EtcdKv>, conf: &BackendConfig) -> Result<Self> {
        let mut path = conf.get_or("path", DEFAULT_PATH).to_string();
        if !path.ends_with('/') {
            path.push('/');
        }
        let lock_path = format!("{}-locks/", path.trim_end_matches('/'));
        let ha_enabled = match conf.get_or_env("ha_enabled", "ETCD_HA_ENABLED") {
            Some(raw) => crate::config::parse_bool("ha_enabled", &raw)?,
            None => false,
        };
        Ok(Self {
            client,
            path,
            lock_path,
            permit_pool: PermitPool::new(conf.max_parallel()?),
            ha_enabled,
            lock_ttl: conf.parse_duration("lock_timeout", DEFAULT_LOCK_TTL)?,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.path, key)
    }
}

/// Only the v3 API is spoken. Asking for v2 falls back to v3.
fn check_api_version(api: Option<&str>) -> Result<()> {
    match api {
        None | Some("3") | Some("v3") => Ok(()),
        Some("2") | Some("v2") => {
            warn!("etcd v2 API is unsupported, falling back to v3");
            Ok(())
        }
        Some(other) => Err(PhysicalError::Config(format!(
            "unknown etcd_api version {other:?}"
        ))),
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("etcd", "put");
        validate_key(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.client
            .put(&self.full_key(&entry.key), &entry.value, None)
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("etcd", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let kv = self.client.get(&self.full_key(key)).await?;
        Ok(kv.map(|kv| Entry::new(key, kv.value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("etcd", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.client.delete(&self.full_key(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("etcd", "list");
        let _permit = self.permit_pool.acquire().await?;

        let full = self.full_key(prefix);
        let keys = self.client.keys_with_prefix(&full).await?;
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
}

#[async_trait]
impl Transactional for EtcdBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("etcd", "transaction");
        if txns.len() > MAX_TXN_OPS {
            return Err(PhysicalError::TooManyStatements {
                count: txns.len(),
                limit: MAX_TXN_OPS,
            });
        }
        let ops = txns
            .into_iter()
            .map(|txn| {
                validate_key(&txn.entry.key)?;
                let key = self.full_key(&txn.entry.key);
                match txn.operation {
                    Operation::Put => Ok(TxnOp::Put {
                        key,
                        value: txn.entry.value,
                    }),
                    Operation::Delete => Ok(TxnOp::Delete { key }),
                    other => Err(PhysicalError::Unsupported(format!(
                        "operation {other} is not allowed in a transaction"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        if ops.is_empty() {
            return Ok(());
        }

        let _permit = self.permit_pool.acquire().await?;
        self.client.txn(&ops).await
    }
}

impl HaBackend for EtcdBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        validate_key(key)?;
        Ok(Box::new(EtcdLock::new(
            self.client.clone(),
            format!("{}{}", self.lock_path, key),
            value.to_string(),
            self.lock_ttl,
        )))
    }

    fn ha_enabled(&self) -> bool {
        self.ha_enabled
    }
}
