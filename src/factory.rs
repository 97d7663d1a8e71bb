//! Boot-time construction: driver selection and decorator layering.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::Cache;
use crate::config::{BackendConfig, LayerOptions};
use crate::consul::ConsulBackend;
use crate::dynamodb::DynamoDbBackend;
use crate::encoding::StorageEncoding;
use crate::error::{PhysicalError, Result};
use crate::etcd::EtcdBackend;
use crate::file::FileBackend;
use crate::latency::{LatencyInjector, DEFAULT_JITTER_PERCENT};
use crate::memory::{InmemBackend, InmemHaBackend, TransactionalInmemBackend};
use crate::mongo::MongoBackend;
use crate::object::{new_azure, new_gcs, new_s3, MantaBackend};
use crate::raft::RaftBackend;
use crate::sql::{MySqlBackend, PostgresBackend, SqliteBackend};
use crate::store::Backend;
use crate::view::View;

/// Driver names accepted by [`new_backend`].
pub const BACKEND_KINDS: &[&str] = &[
    "inmem",
    "inmem_transactional",
    "inmem_ha",
    "file",
    "file_transactional",
    "sqlite",
    "postgresql",
    "mysql",
    "s3",
    "azure",
    "gcs",
    "manta",
    "consul",
    "etcd",
    "raft",
    "dynamodb",
    "mongodb",
];

/// Build the driver named `kind` from its configuration map.
pub async fn new_backend(kind: &str, conf: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match kind {
        "inmem" => Arc::new(InmemBackend::new()),
        "inmem_transactional" => Arc::new(TransactionalInmemBackend::new()),
        "inmem_ha" => Arc::new(InmemHaBackend::new()),
        "file" => Arc::new(FileBackend::new(conf).await?),
        "file_transactional" => Arc::new(FileBackend::new_transactional(conf).await?),
        "sqlite" => Arc::new(SqliteBackend::new(conf).await?),
        "postgresql" => Arc::new(PostgresBackend::new(conf).await?),
        "mysql" => Arc::new(MySqlBackend::new(conf).await?),
        "s3" => Arc::new(new_s3(conf)?),
        "azure" => Arc::new(new_azure(conf)?),
        "gcs" => Arc::new(new_gcs(conf)?),
        "manta" => Arc::new(MantaBackend::new(conf).await?),
        "consul" => Arc::new(ConsulBackend::new(conf)?),
        "etcd" => Arc::new(EtcdBackend::new(conf)?),
        "raft" => Arc::new(RaftBackend::new(conf).await?),
        "dynamodb" => Arc::new(DynamoDbBackend::new(conf).await?),
        "mongodb" => Arc::new(MongoBackend::new(conf).await?),
        other => {
            return Err(PhysicalError::Config(format!(
                "unknown storage type {other:?}"
            )))
        }
    };
    info!(kind, capabilities = %backend.capabilities(), "Storage backend ready");
    Ok(backend)
}

/// Wrap `inner` with the configured decorators: view, then key encoding,
/// then cache, then latency injection (outermost).
pub fn compose(inner: Arc<dyn Backend>, opts: &LayerOptions) -> Arc<dyn Backend> {
    let mut backend = inner;
    if let Some(prefix) = opts.view_prefix.as_deref().filter(|p| !p.is_empty()) {
        backend = Arc::new(View::new(backend, prefix));
    }
    if opts.enforce_key_encoding {
        backend = Arc::new(StorageEncoding::new(backend));
    }
    if !opts.disable_cache {
        backend = Arc::new(Cache::new(backend, opts.cache_size, &opts.cache_exceptions));
    }
    if let Some(ms) = opts.latency_ms {
        backend = Arc::new(LatencyInjector::new(
            backend,
            Duration::from_millis(ms),
            opts.jitter_percent.unwrap_or(DEFAULT_JITTER_PERCENT),
        ));
    }
    backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Entry, TxnEntry};
    use crate::testing::exercise_backend;

    #[tokio::test]
    async fn test_unknown_kind() {
        let err = new_backend("floppy", &BackendConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PhysicalError::Config(_)));
    }

    #[tokio::test]
    async fn test_file_requires_path() {
        assert!(new_backend("file", &BackendConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_compose_full_stack() {
        let inner = new_backend("inmem_transactional", &BackendConfig::default())
            .await
            .unwrap();
        let opts: LayerOptions = serde_json::from_value(serde_json::json!({
            "view_prefix": "app/",
            "enforce_key_encoding": true,
            "cache_exceptions": ["core/leader/"],
            "latency_ms": 1,
        }))
        .unwrap();
        let outer = compose(inner.clone(), &opts);

        let caps = outer.capabilities();
        assert!(caps.transactional);
        assert!(caps.purgeable);
        assert!(!caps.ha);

        exercise_backend(outer.as_ref()).await;

        outer.put(Entry::new("x", b"1".to_vec())).await.unwrap();
        assert!(inner.get("app/x").await.unwrap().is_some());
        assert!(outer.put(Entry::new("bad\n", b"1".to_vec())).await.is_err());
        assert!(outer.get("../x").await.is_err());

        outer
            .as_transactional()
            .unwrap()
            .transaction(vec![TxnEntry::delete("x")])
            .await
            .unwrap();
        assert!(inner.get("app/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compose_defaults_add_cache_only() {
        let inner = new_backend("inmem_ha", &BackendConfig::default()).await.unwrap();
        let outer = compose(inner, &LayerOptions::default());
        let caps = outer.capabilities();
        assert!(caps.purgeable);
        assert!(caps.ha);
        assert!(!caps.transactional);

        let bare = compose(
            new_backend("inmem", &BackendConfig::default()).await.unwrap(),
            &LayerOptions {
                disable_cache: true,
                ..LayerOptions::default()
            },
        );
        assert!(!bare.capabilities().purgeable);
    }
}
