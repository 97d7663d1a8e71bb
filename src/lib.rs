//! # univrs-physical
//!
//! Pluggable physical storage for the Univrs ecosystem.
//!
//! Every driver implements one key/value contract, [`Backend`], with the
//! same observable semantics:
//!
//! - **Hierarchical keys**: '/'-separated (`sys/policy/root`); `list`
//!   returns the first segment below a prefix, folders suffixed with '/'
//! - **Optional capabilities**: atomic transactions, HA leader locks,
//!   service discovery, redirect detection, cache purge, discovered at runtime
//! - **Decorators**: sub-tree view, key encoding checks, read-through cache
//!   and latency injection, all themselves backends
//!
//! ## Drivers
//!
//! - [`InmemBackend`], [`TransactionalInmemBackend`], [`InmemHaBackend`]
//! - [`FileBackend`]: one JSON file per entry
//! - [`SqliteBackend`], [`PostgresBackend`], [`MySqlBackend`]
//! - [`ObjectStoreBackend`]: S3, Azure Blob, GCS
//! - [`MantaBackend`]: Joyent Manta with signed requests
//! - [`ConsulBackend`], [`EtcdBackend`]: distributed KV with HA locks
//! - [`RaftBackend`]: replicated log with an embedded state machine
//! - [`DynamoDbBackend`], [`MongoBackend`]: document stores with HA locks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use univrs_physical::{compose, new_backend, Backend, BackendConfig, Entry, LayerOptions};
//!
//! #[tokio::main]
//! async fn main() -> univrs_physical::Result<()> {
//!     let conf = BackendConfig::from([("path", "/var/lib/univrs")]);
//!     let backend = compose(new_backend("file", &conf).await?, &LayerOptions::default());
//!
//!     backend.put(Entry::new("sys/token/abc", b"secret".to_vec())).await?;
//!     if let Some(entry) = backend.get("sys/token/abc").await? {
//!         println!("Value: {:?}", String::from_utf8_lossy(&entry.value));
//!     }
//!     println!("{:?}", backend.list("sys/").await?);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! use univrs_physical::{Backend, BackendExt, Entry, TransactionalInmemBackend, TxnEntry};
//!
//! #[tokio::main]
//! async fn main() -> univrs_physical::Result<()> {
//!     let backend = TransactionalInmemBackend::new();
//!     backend.put(Entry::new("nodes/a", b"w1".to_vec())).await?;
//!
//!     // Move the workload from node a to node b
//!     backend
//!         .run_transaction(vec![
//!             TxnEntry::delete("nodes/a"),
//!             TxnEntry::put(Entry::new("nodes/b", b"w1".to_vec())),
//!         ])
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Leader election
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use univrs_physical::{Backend, InmemHaBackend};
//!
//! #[tokio::main]
//! async fn main() -> univrs_physical::Result<()> {
//!     let backend = InmemHaBackend::new();
//!     let ha = backend.as_ha().expect("HA capable");
//!     let lock = ha.lock_with("core/lock", "node-1")?;
//!
//!     if let Some(leader) = lock.lock(CancellationToken::new()).await? {
//!         // Serve as active node until leadership is lost.
//!         leader.lost().await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod consul;
pub mod dynamodb;
pub mod encoding;
pub mod error;
pub mod etcd;
pub mod factory;
pub mod file;
pub mod latency;
pub mod lock;
pub mod memory;
pub mod mongo;
pub mod object;
pub mod permit;
pub mod raft;
pub mod sql;
pub mod store;
pub mod telemetry;
pub mod transaction;
pub mod util;
pub mod view;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types
pub use cache::Cache;
pub use config::{BackendConfig, LayerOptions};
pub use consul::ConsulBackend;
pub use dynamodb::DynamoDbBackend;
pub use encoding::StorageEncoding;
pub use error::{ErrorKind, PhysicalError, Result};
pub use etcd::EtcdBackend;
pub use factory::{compose, new_backend};
pub use file::FileBackend;
pub use latency::LatencyInjector;
pub use lock::{LeaderLost, Lock};
pub use memory::{InmemBackend, InmemHaBackend, TransactionalInmemBackend};
pub use mongo::MongoBackend;
pub use object::{MantaBackend, ObjectStoreBackend};
pub use permit::PermitPool;
pub use raft::RaftBackend;
pub use sql::{MySqlBackend, PostgresBackend, SqliteBackend};
pub use store::{
    validate_key, Backend, BackendExt, Capabilities, Entry, HaBackend, Operation, Purgeable,
    RedirectDetect, ServiceDiscovery, Transactional, TxnEntry, MAX_KEY_LENGTH,
};
pub use transaction::{generic_transaction_handler, PseudoTransactional};
pub use view::View;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{BackendConfig, LayerOptions};
    pub use crate::error::{ErrorKind, PhysicalError, Result};
    pub use crate::factory::{compose, new_backend};
    pub use crate::lock::{LeaderLost, Lock};
    pub use crate::store::{
        Backend, BackendExt, Entry, HaBackend, Purgeable, Transactional, TxnEntry,
    };
}
