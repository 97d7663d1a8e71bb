//! The raft log store.
//!
//! Entries are kept in an ordered map. With a data directory, every change
//! is also written to `raft.log` as one JSON [`LogRecord`] per line (an
//! append, a truncation or a purge) and replayed in order on open. The vote
//! and commit index live in `raft-state.json`, replaced atomically.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{OptionalSend, StorageIOError};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{Entry, LogId, StorageError, TypeConfig, Vote};
use crate::error::{PhysicalError, Result};

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft-state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Append { entry: Entry },
    /// Entries at and after `since` were removed.
    Truncate { since: u64 },
    /// Entries up to and including `log_id` were removed.
    Purge { log_id: LogId },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HardState {
    vote: Option<Vote>,
    committed: Option<LogId>,
}

struct LogFiles {
    dir: PathBuf,
    log: File,
}

impl LogFiles {
    async fn write(&mut self, records: &[LogRecord]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        self.log.write_all(&buf).await?;
        self.log.sync_data().await?;
        Ok(())
    }

    async fn write_state(&self, state: &HardState) -> Result<()> {
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec(state)?).await?;
        fs::rename(&tmp, self.dir.join(STATE_FILE)).await?;
        Ok(())
    }

    /// Rewrite the log to hold exactly `records`.
    async fn rewrite(&mut self, records: &[LogRecord]) -> Result<()> {
        let path = self.dir.join(LOG_FILE);
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let mut file = File::create(&tmp).await?;
            let mut buf = Vec::new();
            for record in records {
                serde_json::to_writer(&mut buf, record)?;
                buf.push(b'\n');
            }
            file.write_all(&buf).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &path).await?;
        self.log = OpenOptions::new().append(true).open(&path).await?;
        Ok(())
    }
}

#[derive(Default)]
struct LogInner {
    entries: BTreeMap<u64, Entry>,
    last_purged: Option<LogId>,
    state: HardState,
    files: Option<LogFiles>,
}

impl LogInner {
    fn replay(&mut self, record: LogRecord) {
        match record {
            LogRecord::Append { entry } => {
                self.entries.insert(entry.log_id.index, entry);
            }
            LogRecord::Truncate { since } => {
                self.entries.split_off(&since);
            }
            LogRecord::Purge { log_id } => self.purge_to(log_id),
        }
    }

    fn purge_to(&mut self, log_id: LogId) {
        self.entries = self.entries.split_off(&(log_id.index + 1));
        self.last_purged = Some(log_id);
    }

    fn last_log_id(&self) -> Option<LogId> {
        self.entries
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(self.last_purged)
    }

    async fn save_state(&self) -> Result<()> {
        match &self.files {
            Some(files) => files.write_state(&self.state).await,
            None => Ok(()),
        }
    }
}

fn parse_log(raw: &str) -> Result<Vec<LogRecord>> {
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => records.push(record),
            // A torn final write from a crash.
            Err(e) if i + 1 == lines.len() => {
                warn!(error = %e, "ignoring truncated final raft log record");
            }
            Err(e) => {
                return Err(PhysicalError::Protocol(format!(
                    "corrupt raft log record {}: {e}",
                    i + 1
                )))
            }
        }
    }
    Ok(records)
}

fn log_error(e: &PhysicalError) -> StorageError {
    StorageIOError::write_logs(e).into()
}

fn vote_error(e: &PhysicalError) -> StorageError {
    StorageIOError::write_vote(e).into()
}

/// Log storage handed to openraft; clones share one log.
#[derive(Clone, Default)]
pub struct LogStore {
    inner: Arc<Mutex<LogInner>>,
}

impl LogStore {
    /// A log that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open or create the log under `dir`, replaying what is there.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut inner = LogInner::default();
        match fs::read(dir.join(STATE_FILE)).await {
            Ok(raw) => inner.state = serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let log_path = dir.join(LOG_FILE);
        let records = match fs::read_to_string(&log_path).await {
            Ok(raw) => parse_log(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let replayed = records.len();
        for record in records {
            inner.replay(record);
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        info!(
            dir = %dir.display(),
            replayed,
            entries = inner.entries.len(),
            last_log = ?inner.last_log_id(),
            "Opened raft log"
        );
        inner.files = Some(LogFiles { dir, log });
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    async fn append_entries(&self, entries: Vec<Entry>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(files) = inner.files.as_mut() {
            let records: Vec<LogRecord> = entries
                .iter()
                .map(|entry| LogRecord::Append {
                    entry: entry.clone(),
                })
                .collect();
            files.write(&records).await?;
        }
        for entry in entries {
            inner.entries.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn truncate_since(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(files) = inner.files.as_mut() {
            files.write(&[LogRecord::Truncate { since: index }]).await?;
        }
        inner.entries.split_off(&index);
        Ok(())
    }

    /// Drop entries up to `log_id` and compact the file to what remains.
    async fn purge_upto(&self, log_id: LogId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.purge_to(log_id);
        let mut records = vec![LogRecord::Purge { log_id }];
        records.extend(inner.entries.values().map(|entry| LogRecord::Append {
            entry: entry.clone(),
        }));
        if let Some(files) = inner.files.as_mut() {
            files.rewrite(&records).await?;
        }
        debug!(index = log_id.index, remaining = inner.entries.len(), "purged raft log");
        Ok(())
    }

    #[cfg(test)]
    async fn indexes(&self) -> Vec<u64> {
        self.inner.lock().await.entries.keys().copied().collect()
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> std::result::Result<LogState<TypeConfig>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(LogState {
            last_purged_log_id: inner.last_purged,
            last_log_id: inner.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> std::result::Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.state.vote = Some(vote.clone());
        inner.save_state().await.map_err(|e| vote_error(&e))
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<Vote>, StorageError> {
        Ok(self.inner.lock().await.state.vote.clone())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId>,
    ) -> std::result::Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.state.committed = committed;
        inner.save_state().await.map_err(|e| log_error(&e))
    }

    async fn read_committed(&mut self) -> std::result::Result<Option<LogId>, StorageError> {
        Ok(self.inner.lock().await.state.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> std::result::Result<(), StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<Entry> = entries.into_iter().collect();
        match self.append_entries(entries).await {
            Ok(()) => {
                callback.log_io_completed(Ok(()));
                Ok(())
            }
            Err(e) => {
                callback.log_io_completed(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )));
                Err(log_error(&e))
            }
        }
    }

    async fn truncate(&mut self, log_id: LogId) -> std::result::Result<(), StorageError> {
        self.truncate_since(log_id.index)
            .await
            .map_err(|e| log_error(&e))
    }

    async fn purge(&mut self, log_id: LogId) -> std::result::Result<(), StorageError> {
        self.purge_upto(log_id).await.map_err(|e| log_error(&e))
    }
}
