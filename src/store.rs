//! Backend trait - the core abstraction for all physical storage drivers.
//!
//! - `Entry`: key + opaque value + seal-wrap flag
//! - `TxnEntry`: an operation tag paired with an entry
//! - Core operations: get, put, delete, list
//! - Optional capabilities: transactions, HA locking, service discovery,
//!   redirect-host detection, purging of in-memory caches

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PhysicalError, Result};
use crate::lock::Lock;

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 4096;

/// A single durable record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The key, using '/' as a hierarchy separator.
    #[serde(rename = "Key")]
    pub key: String,
    /// The value (opaque bytes).
    #[serde(rename = "Value", with = "crate::util::base64_bytes")]
    pub value: Vec<u8>,
    /// Advisory flag asking the seal layer to wrap this entry.
    #[serde(rename = "seal_wrap", default)]
    pub seal_wrap: bool,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            seal_wrap: false,
        }
    }

    /// Mark the entry as seal-wrap requested.
    pub fn sealed(mut self) -> Self {
        self.seal_wrap = true;
        self
    }

    /// Deserialize the value as JSON.
    pub fn value_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(Into::into)
    }

    /// Size used when checking driver limits.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// The operations a consumer may perform against a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Put,
    Get,
    Delete,
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Put => "put",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::List => "list",
        };
        f.write_str(name)
    }
}

/// An operation within a transaction. For deletes only `entry.key` matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnEntry {
    pub operation: Operation,
    pub entry: Entry,
}

impl TxnEntry {
    /// Create a Put operation.
    pub fn put(entry: Entry) -> Self {
        Self {
            operation: Operation::Put,
            entry,
        }
    }

    /// Create a Delete operation.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            entry: Entry {
                key: key.into(),
                ..Entry::default()
            },
        }
    }

    pub fn key(&self) -> &str {
        &self.entry.key
    }
}

/// Validate that a key is well-formed.
///
/// Keys are '/'-separated, never start with '/', and never contain an empty
/// segment.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PhysicalError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(PhysicalError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.starts_with('/') {
        return Err(PhysicalError::InvalidKey(format!(
            "key must not start with '/': {key}"
        )));
    }
    if key.split('/').any(str::is_empty) {
        return Err(PhysicalError::InvalidKey(format!(
            "key contains an empty segment: {key}"
        )));
    }
    Ok(())
}

/// The set of optional capabilities a backend advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub transactional: bool,
    pub ha: bool,
    pub service_discovery: bool,
    pub redirect_detect: bool,
    pub purgeable: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.transactional {
            names.push("transactional");
        }
        if self.ha {
            names.push("ha");
        }
        if self.service_discovery {
            names.push("service-discovery");
        }
        if self.redirect_detect {
            names.push("redirect-detect");
        }
        if self.purgeable {
            names.push("purgeable");
        }
        write!(f, "[{}]", names.join(", "))
    }
}

/// The core physical storage trait.
///
/// All drivers (memory, file, SQL, object stores, Consul, etcd, raft,
/// DynamoDB) and all decorators implement this trait. Code should depend on
/// this trait, not specific implementations.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store an entry. The entry is durable when this returns.
    async fn put(&self, entry: Entry) -> Result<()>;

    /// Get an entry by key.
    ///
    /// Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Delete a key.
    ///
    /// Returns `Ok(())` if the key was deleted or didn't exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the distinct first segments below a prefix.
    ///
    /// Returns segments in lexicographic order; a segment with children is
    /// suffixed with '/'.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Release sessions, pools and background tasks.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        None
    }

    fn as_service_discovery(&self) -> Option<&dyn ServiceDiscovery> {
        None
    }

    fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
        None
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        None
    }

    /// Capability flags derived from the `as_*` accessors.
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: self.as_transactional().is_some(),
            ha: self.as_ha().map(|ha| ha.ha_enabled()).unwrap_or(false),
            service_discovery: self.as_service_discovery().is_some(),
            redirect_detect: self.as_redirect_detect().is_some(),
            purgeable: self.as_purgeable().is_some(),
        }
    }
}

/// Backends that can commit an ordered list of operations atomically.
#[async_trait]
pub trait Transactional: Backend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()>;
}

/// Backends that provide a distributed leader lock.
pub trait HaBackend: Backend {
    /// Create a lock handle on `key`, identified by `value` while held.
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>>;

    /// Whether HA is active for this backend instance.
    fn ha_enabled(&self) -> bool;
}

/// Predicate callback used by service discovery.
pub type StatusFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Backends that can advertise this node in a service catalog.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    fn notify_active_state_change(&self) -> Result<()>;

    fn notify_sealed_state_change(&self) -> Result<()>;

    /// Run until `shutdown` fires, keeping the registration in sync.
    async fn run_service_discovery(
        &self,
        shutdown: CancellationToken,
        redirect_addr: String,
        is_active: StatusFn,
        is_sealed: StatusFn,
    ) -> Result<()>;
}

/// Backends that can compute the cluster-routable host for this node.
#[async_trait]
pub trait RedirectDetect: Send + Sync {
    async fn detect_host_addr(&self) -> Result<String>;
}

/// Backends holding in-memory caches that can be emptied at runtime.
#[async_trait]
pub trait Purgeable: Send + Sync {
    async fn purge(&self);
}

/// Convenience helpers available on every backend.
#[async_trait]
pub trait BackendExt: Backend {
    /// Get an entry, failing with `KeyNotFound` if absent.
    async fn get_required(&self, key: &str) -> Result<Entry> {
        self.get(key)
            .await?
            .ok_or_else(|| PhysicalError::KeyNotFound(key.to_string()))
    }

    /// Get an entry and deserialize as JSON.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(entry) => Ok(Some(entry.value_json()?)),
            None => Ok(None),
        }
    }

    /// Store a JSON-encoded value.
    async fn put_json<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(Entry::new(key, bytes)).await
    }

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Run a transaction, failing with `Unsupported` if the backend has no
    /// transactional capability.
    async fn run_transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        match self.as_transactional() {
            Some(txn) => txn.transaction(txns).await,
            None => Err(PhysicalError::Unsupported(
                "backend does not support transactions".to_string(),
            )),
        }
    }
}

impl<B: Backend + ?Sized> BackendExt for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("test").is_ok());
        assert!(validate_key("workloads/abc-123").is_ok());
        assert!(validate_key("nodes/n1/containers/c1").is_ok());
    }

    #[test]
    fn test_validate_key_empty() {
        let err = validate_key("").unwrap_err();
        assert!(matches!(err, PhysicalError::InvalidKey(_)));
    }

    #[test]
    fn test_validate_key_leading_slash() {
        let err = validate_key("/test").unwrap_err();
        assert!(matches!(err, PhysicalError::InvalidKey(_)));
    }

    #[test]
    fn test_validate_key_empty_segment() {
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/").is_err());
    }

    #[test]
    fn test_validate_key_too_long() {
        let key = "a".repeat(MAX_KEY_LENGTH + 1);
        let err = validate_key(&key).unwrap_err();
        assert!(matches!(err, PhysicalError::InvalidKey(_)));
    }

    #[test]
    fn test_txn_entry_creation() {
        let op = TxnEntry::put(Entry::new("key", vec![1, 2, 3]));
        assert_eq!(op.operation, Operation::Put);

        let op = TxnEntry::delete("key");
        assert_eq!(op.operation, Operation::Delete);
        assert_eq!(op.key(), "key");
        assert!(op.entry.value.is_empty());
    }

    #[test]
    fn test_entry_json_form() {
        let entry = Entry::new("a/b", b"v".to_vec()).sealed();
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"Key":"a/b","Value":"dg==","seal_wrap":true}"#);

        let back: Entry = serde_json::from_str(r#"{"Key":"a/b","Value":"dg=="}"#).unwrap();
        assert_eq!(back.value, b"v");
        assert!(!back.seal_wrap);
    }

    #[test]
    fn test_capabilities_display() {
        let caps = Capabilities {
            transactional: true,
            ha: true,
            ..Capabilities::default()
        };
        assert_eq!(caps.to_string(), "[transactional, ha]");
    }
}
