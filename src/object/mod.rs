//! Object-store drivers (S3, Azure blob, Google Cloud Storage, Manta).
//!
//! The first three share [`ObjectStoreBackend`] over an
//! `object_store::ObjectStore` and differ only in how the client is built;
//! the object name is the key. Manta has real directories and its own
//! request signing, so it gets a driver of its own in [`manta`].

pub mod cloud;
pub mod manta;

pub use cloud::{new_azure, new_gcs, new_s3};
pub use manta::{MantaBackend, MantaSigner};

use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::debug;

use crate::error::{PhysicalError, Result};
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry};
use crate::telemetry::measure;

/// Backend over any [`ObjectStore`].
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    driver: &'static str,
    permit_pool: PermitPool,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, driver: &'static str, max_parallel: usize) -> Self {
        Self {
            store,
            driver,
            permit_pool: PermitPool::new(max_parallel),
        }
    }

    pub fn driver(&self) -> &'static str {
        self.driver
    }

    fn object_path(&self, key: &str) -> Result<Path> {
        validate_key(key)?;
        parse_path(key)
    }

    /// Names of the direct children of `dir` (which is "" or ends in '/'):
    /// leaves as `name`, sub-directories as `name/`.
    async fn children(&self, dir: &str) -> Result<Vec<String>> {
        let dir_path = if dir.is_empty() {
            None
        } else {
            Some(parse_path(dir)?)
        };
        let listing = self.store.list_with_delimiter(dir_path.as_ref()).await?;

        let mut names = Vec::new();
        for object in &listing.objects {
            if let Some(name) = object.location.as_ref().strip_prefix(dir) {
                names.push(name.to_string());
            }
        }
        for common in &listing.common_prefixes {
            if let Some(name) = common.as_ref().strip_prefix(dir) {
                names.push(format!("{name}/"));
            }
        }
        Ok(names)
    }
}

fn parse_path(raw: &str) -> Result<Path> {
    Path::parse(raw).map_err(|e| PhysicalError::InvalidKey(e.to_string()))
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure(self.driver, "put");
        let path = self.object_path(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        self.store.put(&path, entry.value.into()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure(self.driver, "get");
        let path = self.object_path(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        Ok(Some(Entry::new(key, bytes.to_vec())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure(self.driver, "delete");
        let path = self.object_path(key)?;
        let _permit = self.permit_pool.acquire().await?;

        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure(self.driver, "list");
        let _permit = self.permit_pool.acquire().await?;

        // A prefix may end mid-segment; list its directory and filter.
        let (dir, partial) = match prefix.rfind('/') {
            Some(i) => prefix.split_at(i + 1),
            None => ("", prefix),
        };
        let children = self.children(dir).await?;
        debug!(driver = self.driver, prefix, count = children.len(), "listed objects");

        let mut names: Vec<String> = children
            .into_iter()
            .filter_map(|child| child.strip_prefix(partial).map(str::to_string))
            .filter(|rest| !rest.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
