//! DynamoDB backend.
//!
//! A key is split into a partition key (`Path`, the parent path, `" "` at
//! the root) and a sort key (`Key`, the leaf name), so a list is a single
//! partition query. Every put also writes a marker row `<leaf>/` for each
//! ancestor so folders show up in their parent's partition.

mod lock;
pub mod table;

#[cfg(test)]
pub(crate) mod fake;

pub use lock::{DynamoLock, LockTimings};
pub use table::{AwsTable, DynamoTable, Item, WriteRequest};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::config::retry::RetryConfig;
use aws_sdk_dynamodb::config::{Credentials, Region};
use tracing::{debug, info, warn};

use crate::config::{parse_bool, BackendConfig};
use crate::error::{PhysicalError, Result};
use crate::lock::Lock;
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, HaBackend};
use crate::telemetry::measure;
use crate::util::{prefixes, split_parent};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_TABLE: &str = "vault-dynamodb-backend";
pub const DEFAULT_READ_CAPACITY: i64 = 5;
pub const DEFAULT_WRITE_CAPACITY: i64 = 5;

/// Maximum item size accepted by DynamoDB.
pub const MAX_ITEM_SIZE: usize = 400 * 1024;

/// Stands in for the empty partition key of root-level entries.
const EMPTY_PATH: &str = " ";
/// Leaf-name prefix of lock rows; such rows are never listed.
const LOCK_PREFIX: &str = "_";
/// BatchWriteItem request limit.
const BATCH_SIZE: usize = 25;
const BATCH_RETRY_START: Duration = Duration::from_millis(100);
const BATCH_RETRY_MAX: Duration = Duration::from_secs(10);
const BATCH_RETRY_ELAPSED: Duration = Duration::from_secs(600);

/// Parsed driver settings. Environment variables win over the config map.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamoSettings {
    pub table: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub read_capacity: i64,
    pub write_capacity: i64,
    pub max_retries: Option<u32>,
    pub ha_enabled: bool,
    pub recovery_mode: bool,
    pub max_parallel: usize,
}

fn env_then_conf(conf: &BackendConfig, key: &str, envs: &[&str]) -> Option<String> {
    envs.iter()
        .filter_map(|env| std::env::var(env).ok())
        .find(|v| !v.is_empty())
        .or_else(|| conf.get(key).map(str::to_string))
}

fn capacity(conf: &BackendConfig, key: &str, env: &str, default: i64) -> Result<i64> {
    match env_then_conf(conf, key, &[env]) {
        Some(raw) => {
            let n: i64 = raw
                .trim()
                .parse()
                .map_err(|_| PhysicalError::Config(format!("invalid {key}: {raw:?}")))?;
            Ok(if n == 0 { default } else { n })
        }
        None => Ok(default),
    }
}

impl DynamoSettings {
    pub fn from_config(conf: &BackendConfig) -> Result<Self> {
        let max_retries = match env_then_conf(conf, "dynamodb_max_retries", &["AWS_DYNAMODB_MAX_RETRIES"]) {
            Some(raw) => Some(
                raw.trim()
                    .parse()
                    .map_err(|_| PhysicalError::Config(format!("invalid max retry: {raw:?}")))?,
            ),
            None => None,
        };
        let ha_enabled = match env_then_conf(conf, "ha_enabled", &["DYNAMODB_HA_ENABLED"]) {
            Some(raw) => parse_bool("ha_enabled", &raw)?,
            None => false,
        };
        let recovery_mode = match conf.get("recovery_mode") {
            Some(raw) => parse_bool("recovery_mode", raw)?,
            None => false,
        };
        Ok(Self {
            table: env_then_conf(conf, "table", &["AWS_DYNAMODB_TABLE"])
                .unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            region: env_then_conf(
                conf,
                "region",
                &["AWS_DYNAMODB_REGION", "AWS_REGION", "AWS_DEFAULT_REGION"],
            )
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            endpoint: env_then_conf(conf, "endpoint", &["AWS_DYNAMODB_ENDPOINT"]),
            read_capacity: capacity(conf, "read_capacity", "AWS_DYNAMODB_READ_CAPACITY", DEFAULT_READ_CAPACITY)?,
            write_capacity: capacity(conf, "write_capacity", "AWS_DYNAMODB_WRITE_CAPACITY", DEFAULT_WRITE_CAPACITY)?,
            max_retries,
            // A node in recovery never contends for leadership.
            ha_enabled: ha_enabled && !recovery_mode,
            recovery_mode,
            max_parallel: conf.max_parallel()?,
        })
    }
}

fn record_path(key: &str) -> &str {
    match split_parent(key) {
        ("", _) => EMPTY_PATH,
        (parent, _) => parent,
    }
}

fn record_key(key: &str) -> &str {
    split_parent(key).1
}

fn escape_empty(path: &str) -> &str {
    if path.is_empty() {
        EMPTY_PATH
    } else {
        path
    }
}

/// Lock rows live next to their key with [`LOCK_PREFIX`] on the leaf.
fn lock_row(key: &str) -> (String, String) {
    let (parent, leaf) = split_parent(key);
    (escape_empty(parent).to_string(), format!("{LOCK_PREFIX}{leaf}"))
}

/// DynamoDB implementation of Backend.
pub struct DynamoDbBackend {
    table: Arc<dyn DynamoTable>,
    permit_pool: PermitPool,
    ha_enabled: bool,
    lock_timings: LockTimings,
}

impl DynamoDbBackend {
    /// Connect through the AWS SDK, creating the table if needed.
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let settings = DynamoSettings::from_config(conf)?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let (Some(access_key), Some(secret_key)) = (conf.get("access_key"), conf.get("secret_key")) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                conf.get("session_token").map(str::to_string),
                None,
                "physical-config",
            ));
        }
        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(retries) = settings.max_retries {
            builder = builder.retry_config(RetryConfig::standard().with_max_attempts(retries + 1));
        }
        let client = aws_sdk_dynamodb::Client::from_conf(builder.build());

        let table = AwsTable::new(client, settings.table.clone());
        table
            .ensure_exists(settings.read_capacity, settings.write_capacity)
            .await?;
        info!(table = %settings.table, region = %settings.region, ha_enabled = settings.ha_enabled, "Opened DynamoDB backend");
        Ok(Self::with_table(Arc::new(table), &settings))
    }

    pub fn with_table(table: Arc<dyn DynamoTable>, settings: &DynamoSettings) -> Self {
        if settings.recovery_mode {
            warn!("DynamoDB backend in recovery mode, HA disabled");
        }
        Self {
            table,
            permit_pool: PermitPool::new(settings.max_parallel),
            ha_enabled: settings.ha_enabled,
            lock_timings: LockTimings::default(),
        }
    }

    /// Override lock intervals, mainly for tests.
    pub fn with_lock_timings(mut self, timings: LockTimings) -> Self {
        self.lock_timings = timings;
        self
    }

    /// Whether `path` holds rows other than `excluded`.
    async fn has_children(&self, path: &str, excluded: &str) -> Result<bool> {
        let _permit = self.permit_pool.acquire().await?;
        let items = self.table.query(escape_empty(path), Some(2)).await?;
        Ok(items.iter().any(|item| item.key != excluded))
    }

    /// Submit requests in batches, resubmitting unprocessed ones with
    /// exponential backoff.
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        for chunk in requests.chunks(BATCH_SIZE) {
            let _permit = self.permit_pool.acquire().await?;
            let started = tokio::time::Instant::now();
            let mut delay = BATCH_RETRY_START;
            let mut pending = chunk.to_vec();
            loop {
                pending = self.table.batch_write(pending).await?;
                if pending.is_empty() {
                    break;
                }
                if started.elapsed() + delay > BATCH_RETRY_ELAPSED {
                    return Err(PhysicalError::ConnectionError(
                        "dynamodb: timeout handling unprocessed items".into(),
                    ));
                }
                debug!(unprocessed = pending.len(), ?delay, "retrying unprocessed dynamodb writes");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BATCH_RETRY_MAX);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for DynamoDbBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("dynamodb", "put");
        validate_key(&entry.key)?;
        if entry.size() > MAX_ITEM_SIZE {
            return Err(PhysicalError::too_large(&entry.key, entry.size(), MAX_ITEM_SIZE));
        }

        let mut requests = vec![WriteRequest::Put(Item::new(
            record_path(&entry.key),
            record_key(&entry.key),
            entry.value,
        ))];
        for prefix in prefixes(&entry.key) {
            requests.push(WriteRequest::Put(Item::new(
                record_path(&prefix),
                format!("{}/", record_key(&prefix)),
                Vec::new(),
            )));
        }
        self.batch_write(requests).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("dynamodb", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let item = self.table.get_item(record_path(key), record_key(key)).await?;
        Ok(item.map(|item| Entry::new(key, item.value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("dynamodb", "delete");
        validate_key(key)?;

        let mut requests = vec![WriteRequest::Delete {
            path: record_path(key).to_string(),
            key: record_key(key).to_string(),
        }];

        // Deepest ancestor first: drop its marker while nothing else
        // remains beneath it, stop at the first ancestor still in use.
        let mut excluded = record_key(key).to_string();
        for prefix in prefixes(key).iter().rev() {
            if self.has_children(prefix, &excluded).await? {
                break;
            }
            let marker = format!("{}/", record_key(prefix));
            requests.push(WriteRequest::Delete {
                path: record_path(prefix).to_string(),
                key: marker.clone(),
            });
            excluded = marker;
        }

        self.batch_write(requests).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("dynamodb", "list");
        let _permit = self.permit_pool.acquire().await?;

        let path = prefix.trim_end_matches('/');
        let items = self.table.query(escape_empty(path), None).await?;
        let mut keys: Vec<String> = items
            .into_iter()
            .map(|item| item.key)
            .filter(|key| !key.starts_with(LOCK_PREFIX))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn close(&self) -> Result<()> {
        self.permit_pool.close();
        Ok(())
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }
}

impl HaBackend for DynamoDbBackend {
    fn lock_with(&self, key: &str, value: &str) -> Result<Box<dyn Lock>> {
        validate_key(key)?;
        let (path, row_key) = lock_row(key);
        Ok(Box::new(DynamoLock::new(
            self.table.clone(),
            path,
            row_key,
            value.to_string(),
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
    use fake::FakeTable;
    use tokio_util::sync::CancellationToken;

    fn settings() -> DynamoSettings {
        DynamoSettings {
            table: DEFAULT_TABLE.into(),
            region: DEFAULT_REGION.into(),
            endpoint: None,
            read_capacity: DEFAULT_READ_CAPACITY,
            write_capacity: DEFAULT_WRITE_CAPACITY,
            max_retries: None,
            ha_enabled: true,
            recovery_mode: false,
            max_parallel: 128,
        }
    }

    fn backend(table: &Arc<FakeTable>) -> DynamoDbBackend {
        DynamoDbBackend::with_table(table.clone(), &settings())
    }

    #[tokio::test]
    async fn test_dynamodb_conformance() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        exercise_backend(&b).await;
        exercise_backend_list_prefix(&b).await;
        assert_eq!(table.len(), 0, "markers cleaned up");
    }

    #[tokio::test]
    async fn test_dynamodb_ha() {
        let table = Arc::new(FakeTable::new());
        exercise_ha_backend(&backend(&table), &backend(&table)).await;
    }

    #[tokio::test]
    async fn test_row_layout() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        b.put(Entry::new("a/b/c", b"v".to_vec())).await.unwrap();

        assert_eq!(table.raw("a/b", "c").unwrap().value, b"v");
        assert!(table.raw(" ", "a/").is_some());
        assert!(table.raw("a", "b/").is_some());

        b.put(Entry::new("top", b"t".to_vec())).await.unwrap();
        assert_eq!(table.raw(" ", "top").unwrap().value, b"t");
    }

    #[tokio::test]
    async fn test_delete_keeps_marker_for_sibling_leaf() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        b.put(Entry::new("foo/bar", b"1".to_vec())).await.unwrap();
        b.put(Entry::new("foo/bar/baz", b"2".to_vec())).await.unwrap();

        b.delete("foo/bar/baz").await.unwrap();
        assert!(table.raw("foo", "bar/").is_none());
        assert_eq!(b.list("").await.unwrap(), vec!["foo/"]);
        assert_eq!(b.list("foo/").await.unwrap(), vec!["bar"]);
    }

    #[tokio::test]
    async fn test_too_large() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        let err = b
            .put(Entry::new("big", vec![0u8; MAX_ITEM_SIZE]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TooLarge);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprocessed_items_retried() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        table.throttle_next(2);
        b.put(Entry::new("x/y/z", b"v".to_vec())).await.unwrap();
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn test_batches_of_twenty_five() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        let key = (0..30).map(|i| format!("d{i}")).collect::<Vec<_>>().join("/");
        b.put(Entry::new(key.clone(), b"deep".to_vec())).await.unwrap();
        assert_eq!(table.len(), 30);
        b.delete(&key).await.unwrap();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_lock_rows_hidden_from_list() {
        let table = Arc::new(FakeTable::new());
        let b = backend(&table);
        b.put(Entry::new("core/data", b"1".to_vec())).await.unwrap();

        let lock = b.lock_with("core/lock", "node-a").unwrap();
        lock.lock(CancellationToken::new()).await.unwrap().unwrap();
        let row = table.raw("core", "_lock").unwrap();
        assert_eq!(row.value, b"node-a");
        assert!(row.identity.is_some());
        assert_eq!(b.list("core/").await.unwrap(), vec!["data"]);

        lock.unlock().await.unwrap();
        assert!(table.raw("core", "_lock").is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over_and_loss_detected() {
        let table = Arc::new(FakeTable::new());
        let timings = LockTimings {
            ttl: Duration::from_millis(200),
            renew_interval: Duration::from_secs(60),
            retry_interval: Duration::from_millis(50),
            watch_interval: Duration::from_millis(50),
            watch_retry_max: 5,
        };
        let a = backend(&table).with_lock_timings(timings);
        let b = backend(&table).with_lock_timings(timings);

        let lock_a = a.lock_with("leader", "alice").unwrap();
        let lost_a = lock_a.lock(CancellationToken::new()).await.unwrap().unwrap();

        // alice never renews within the TTL, so bob takes over.
        let lock_b = b.lock_with("leader", "bob").unwrap();
        let _leader_b = tokio::time::timeout(Duration::from_secs(5), lock_b.lock(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), lost_a.lost())
            .await
            .expect("alice notices the takeover");
        assert_eq!(lock_b.value().await.unwrap(), (true, "bob".to_string()));

        // alice's unlock must not remove bob's row.
        lock_a.unlock().await.unwrap();
        assert!(table.raw(" ", "_leader").is_some());
        lock_b.unlock().await.unwrap();
    }

    #[test]
    fn test_record_mapping() {
        assert_eq!(record_path("foo"), " ");
        assert_eq!(record_key("foo"), "foo");
        assert_eq!(record_path("a/b/c"), "a/b");
        assert_eq!(record_key("a/b/c"), "c");
        assert_eq!(lock_row("core/lock"), ("core".to_string(), "_lock".to_string()));
        assert_eq!(lock_row("leader"), (" ".to_string(), "_leader".to_string()));
    }

    #[test]
    fn test_settings() {
        let conf = BackendConfig::from([
            ("read_capacity", "0"),
            ("write_capacity", "10"),
            ("ha_enabled", "true"),
            ("recovery_mode", "true"),
        ]);
        let s = DynamoSettings::from_config(&conf).unwrap();
        if std::env::var("AWS_DYNAMODB_READ_CAPACITY").is_err() {
            assert_eq!(s.read_capacity, DEFAULT_READ_CAPACITY);
        }
        if std::env::var("AWS_DYNAMODB_WRITE_CAPACITY").is_err() {
            assert_eq!(s.write_capacity, 10);
        }
        assert!(s.recovery_mode);
        assert!(!s.ha_enabled);

        let bad = BackendConfig::from([("read_capacity", "lots")]);
        if std::env::var("AWS_DYNAMODB_READ_CAPACITY").is_err() {
            assert!(DynamoSettings::from_config(&bad).is_err());
        }
    }
}
