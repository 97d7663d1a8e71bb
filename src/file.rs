//! Local file backend.
//!
//! One JSON file per entry. A key `a/b/c` lives at `<root>/a/b/_c`, so a
//! directory `c/` and a value `c` can coexist; listing turns `_c` back into
//! `c` and directory `c` into `c/`.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, Transactional, TxnEntry};
use crate::telemetry::measure;
use crate::transaction::{generic_transaction_handler, PseudoTransactional};
use crate::util::split_parent;

/// File implementation of Backend.
pub struct FileBackend {
    root: PathBuf,
    /// Writers hold this exclusively so empty-directory cleanup never races
    /// a concurrent write into the same directory.
    lock: RwLock<()>,
    permit_pool: PermitPool,
    transactional: bool,
}

impl FileBackend {
    /// Open a file backend from its configuration map (`path` required).
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let root = conf.require("path")?;
        Self::open(root, conf.max_parallel()?).await
    }

    /// Open a file backend that also accepts generic transactions.
    pub async fn new_transactional(conf: &BackendConfig) -> Result<Self> {
        let mut backend = Self::new(conf).await?;
        backend.transactional = true;
        Ok(backend)
    }

    /// Open or create a file backend rooted at `root`.
    pub async fn open(root: impl AsRef<Path>, max_parallel: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Opening file backend at {:?}", root);
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock: RwLock::new(()),
            permit_pool: PermitPool::new(max_parallel),
            transactional: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory and file path for a key.
    fn paths_for(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        validate_key(key)?;
        check_relative(key)?;
        let (parent, base) = split_parent(key);
        let dir = if parent.is_empty() {
            self.root.clone()
        } else {
            self.root.join(parent)
        };
        let file = dir.join(format!("_{base}"));
        Ok((dir, file))
    }

    /// Remove now-empty directories from `dir` up to (not including) root.
    async fn cleanup_empty_dirs(&self, mut dir: PathBuf) {
        while dir != self.root && dir.starts_with(&self.root) {
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            debug!("removed empty directory {:?}", dir);
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
    }

    async fn read_entry(&self, key: &str) -> Result<Option<Entry>> {
        let (_, file) = self.paths_for(key)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            // A directory where the file should be still means "no value".
            Err(e) if file.is_dir() => {
                debug!("ignoring {:?}: {}", file, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entry(&self, entry: &Entry) -> Result<()> {
        let (dir, file) = self.paths_for(&entry.key)?;
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(&file, bytes).await?;
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> Result<()> {
        let (dir, file) = self.paths_for(key)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.cleanup_empty_dirs(dir).await;
        Ok(())
    }
}

#[async_trait]
impl PseudoTransactional for FileBackend {
    async fn get_internal(&self, key: &str) -> Result<Option<Entry>> {
        self.read_entry(key).await
    }

    async fn put_internal(&self, entry: Entry) -> Result<()> {
        self.write_entry(&entry).await
    }

    async fn delete_internal(&self, key: &str) -> Result<()> {
        self.remove_entry(key).await
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("file", "put");
        let _permit = self.permit_pool.acquire().await?;
        let _guard = self.lock.write().await;
        self.write_entry(&entry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("file", "get");
        let _permit = self.permit_pool.acquire().await?;
        let _guard = self.lock.read().await;
        self.read_entry(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("file", "delete");
        let _permit = self.permit_pool.acquire().await?;
        let _guard = self.lock.write().await;
        self.remove_entry(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("file", "list");
        let _permit = self.permit_pool.acquire().await?;
        let _guard = self.lock.read().await;

        check_relative(prefix)?;
        let dir = self.root.join(prefix.trim_end_matches('/'));
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(item) = reader.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if item.file_type().await?.is_dir() {
                names.push(format!("{name}/"));
            } else if let Some(stripped) = name.strip_prefix('_') {
                names.push(stripped.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        if self.transactional {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl Transactional for FileBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        if !self.transactional {
            return Err(PhysicalError::Unsupported(
                "file backend was not opened as transactional".to_string(),
            ));
        }
        let _timer = measure("file", "transaction");
        let _permit = self.permit_pool.acquire().await?;
        let _guard = self.lock.write().await;
        generic_transaction_handler(self, txns).await
    }
}

/// Reject keys and prefixes that would resolve outside the root.
fn check_relative(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(PhysicalError::InvalidKey(format!(
            "path must not start with '/': {path}"
        )));
    }
    if path.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(PhysicalError::InvalidKey(format!(
            "path cannot contain '.' or '..' segments: {path}"
        )));
    }
    if path.contains('\0') || path.contains('\\') {
        return Err(PhysicalError::InvalidKey(format!(
            "path contains invalid characters: {path:?}"
        )));
    }
    Ok(())
}
