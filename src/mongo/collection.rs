//! The slice of MongoDB the driver uses, and its implementation over the
//! official driver.
//!
//! Data documents are `{key, value}` with a unique index on `key`. Lock
//! documents live in a separate collection as `{key, value, identity,
//! lastCheckedIn}`; `lastCheckedIn` is always stamped by the server so
//! holders with skewed clocks still agree on staleness.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Document};
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, Tls, TlsOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use super::MongoSettings;
use crate::error::{PhysicalError, Result};

const DUPLICATE_KEY: i32 = 11000;

/// A lock document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub value: String,
    pub identity: String,
}

/// MongoDB operations the driver relies on.
#[async_trait]
pub trait MongoStore: Send + Sync {
    async fn upsert(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn find(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Every stored key starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create the lock document for `identity`, or touch it if it is
    /// already ours. False when someone else holds `key`.
    async fn acquire_lock(&self, key: &str, value: &str, identity: &str) -> Result<bool>;

    /// Touch `lastCheckedIn`. False when the document is no longer ours.
    async fn refresh_lock(&self, key: &str, identity: &str) -> Result<bool>;

    /// Delete the lock document if it still carries `identity`.
    async fn release_lock(&self, key: &str, identity: &str) -> Result<bool>;

    async fn lock_holder(&self, key: &str) -> Result<Option<LockRecord>>;

    /// Delete the lock document when it was last touched more than `ttl`
    /// ago by the server's clock. True if one was removed.
    async fn remove_stale_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// `host:port` of the replica set primary, if the server reports one.
    async fn primary(&self) -> Result<Option<String>>;
}

fn mongo_error(op: &str, err: MongoError) -> PhysicalError {
    let message = format!("mongo {op}: {err}");
    match err.kind.as_ref() {
        MongoErrorKind::Io(_)
        | MongoErrorKind::ServerSelection { .. }
        | MongoErrorKind::ConnectionPoolCleared { .. } => PhysicalError::ConnectionError(message),
        _ => PhysicalError::Protocol(message),
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        MongoErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

/// Escape `raw` for use inside a `$regex` pattern.
pub(crate) fn escape_regex(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if "\\^$.|?*+()[]{}/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// [`MongoStore`] over a live deployment.
pub struct MongoCollection {
    database: Database,
    data: Collection<Document>,
    locks: Collection<Document>,
}

impl MongoCollection {
    /// Connect and make sure both collections carry the unique `key` index.
    pub async fn connect(settings: &MongoSettings) -> Result<Self> {
        let mut options = ClientOptions::parse(&settings.url)
            .await
            .map_err(|e| PhysicalError::Config(format!("mongo: invalid url: {e}")))?;
        if settings.tls {
            let mut tls = TlsOptions::default();
            tls.ca_file_path = settings.tls_ca_file.as_ref().map(PathBuf::from);
            tls.cert_key_file_path = settings.tls_cert_file.as_ref().map(PathBuf::from);
            tls.allow_invalid_certificates = Some(settings.tls_skip_verify);
            options.tls = Some(Tls::Enabled(tls));
        }
        options.connect_timeout = Some(Duration::from_secs(10));
        options
            .app_name
            .get_or_insert_with(|| "univrs-physical".to_string());

        let client =
            Client::with_options(options).map_err(|e| mongo_error("building client", e))?;
        let database = match &settings.database {
            Some(name) => client.database(name),
            None => client
                .default_database()
                .unwrap_or_else(|| client.database(super::DEFAULT_DATABASE)),
        };
        let store = Self {
            data: database.collection(&settings.collection),
            locks: database.collection(&settings.lock_collection),
            database,
        };
        for collection in [&store.data, &store.locks] {
            let index = IndexModel::builder()
                .keys(doc! { "key": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build();
            collection
                .create_index(index)
                .await
                .map_err(|e| mongo_error("create_index", e))?;
        }
        info!(
            database = %store.database.name(),
            collection = %settings.collection,
            lock_collection = %settings.lock_collection,
            "Connected to MongoDB"
        );
        Ok(store)
    }
}

#[async_trait]
impl MongoStore for MongoCollection {
    async fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        let value = Binary {
            subtype: BinarySubtype::Generic,
            bytes: value.to_vec(),
        };
        self.data
            .update_one(doc! { "key": key }, doc! { "$set": { "value": value } })
            .upsert(true)
            .await
            .map_err(|e| mongo_error("upsert", e))?;
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(document) = self
            .data
            .find_one(doc! { "key": key })
            .await
            .map_err(|e| mongo_error("find_one", e))?
        else {
            return Ok(None);
        };
        let value = document
            .get_binary_generic("value")
            .map_err(|e| PhysicalError::Protocol(format!("mongo document for {key}: {e}")))?;
        Ok(Some(value.clone()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data
            .delete_one(doc! { "key": key })
            .await
            .map_err(|e| mongo_error("delete_one", e))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("^{}", escape_regex(prefix));
        let mut cursor = self
            .data
            .find(doc! { "key": { "$regex": pattern } })
            .projection(doc! { "key": 1, "_id": 0 })
            .await
            .map_err(|e| mongo_error("find", e))?;

        let mut keys = Vec::new();
        while cursor.advance().await.map_err(|e| mongo_error("cursor", e))? {
            let document = cursor
                .deserialize_current()
                .map_err(|e| mongo_error("cursor", e))?;
            let key = document
                .get_str("key")
                .map_err(|e| PhysicalError::Protocol(format!("mongo document without key: {e}")))?;
            keys.push(key.to_string());
        }
        debug!(prefix, count = keys.len(), "mongo keys listed");
        Ok(keys)
    }

    async fn acquire_lock(&self, key: &str, value: &str, identity: &str) -> Result<bool> {
        let update = doc! {
            "$set": { "value": value },
            "$currentDate": { "lastCheckedIn": true },
        };
        match self
            .locks
            .update_one(doc! { "key": key, "identity": identity }, update)
            .upsert(true)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(mongo_error("acquire lock", e)),
        }
    }

    async fn refresh_lock(&self, key: &str, identity: &str) -> Result<bool> {
        let result = self
            .locks
            .update_one(
                doc! { "key": key, "identity": identity },
                doc! { "$currentDate": { "lastCheckedIn": true } },
            )
            .await
            .map_err(|e| mongo_error("refresh lock", e))?;
        Ok(result.matched_count > 0)
    }

    async fn release_lock(&self, key: &str, identity: &str) -> Result<bool> {
        let result = self
            .locks
            .delete_one(doc! { "key": key, "identity": identity })
            .await
            .map_err(|e| mongo_error("release lock", e))?;
        Ok(result.deleted_count > 0)
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<LockRecord>> {
        let Some(document) = self
            .locks
            .find_one(doc! { "key": key })
            .await
            .map_err(|e| mongo_error("find lock", e))?
        else {
            return Ok(None);
        };
        let field = |name: &str| {
            document
                .get_str(name)
                .map(str::to_string)
                .map_err(|e| PhysicalError::Protocol(format!("mongo lock {key}: {e}")))
        };
        Ok(Some(LockRecord {
            value: field("value")?,
            identity: field("identity")?,
        }))
    }

    async fn remove_stale_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let filter = doc! {
            "key": key,
            "$expr": {
                "$lte": ["$lastCheckedIn", { "$subtract": ["$$NOW", ttl_ms] }]
            },
        };
        let result = self
            .locks
            .delete_one(filter)
            .await
            .map_err(|e| mongo_error("remove stale lock", e))?;
        Ok(result.deleted_count > 0)
    }

    async fn primary(&self) -> Result<Option<String>> {
        let hello = self
            .database
            .run_command(doc! { "hello": 1 })
            .await
            .map_err(|e| mongo_error("hello", e))?;
        Ok(hello.get_str("primary").ok().map(str::to_string))
    }
}
