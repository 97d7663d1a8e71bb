//! SQLite backend.
//!
//! Embedded database in a single file, WAL mode for concurrent readers.
//! Transactions are native.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use super::{check_txns, like_prefix, table_name, DEFAULT_TABLE};
use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, Operation, Transactional, TxnEntry};
use crate::telemetry::measure;
use crate::util::list_segments;

struct Statements {
    put: String,
    get: String,
    delete: String,
    list: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            put: format!(
                r#"INSERT INTO "{table}" (path, value) VALUES (?, ?)
                ON CONFLICT(path) DO UPDATE SET value = excluded.value"#
            ),
            get: format!(r#"SELECT value FROM "{table}" WHERE path = ?"#),
            delete: format!(r#"DELETE FROM "{table}" WHERE path = ?"#),
            list: format!(r#"SELECT path FROM "{table}" WHERE path LIKE ? ESCAPE '\' ORDER BY path"#),
        }
    }
}

/// SQLite implementation of Backend.
pub struct SqliteBackend {
    pool: SqlitePool,
    table: String,
    statements: Statements,
    permit_pool: PermitPool,
}

impl SqliteBackend {
    /// Open from `connection_url` (e.g. `sqlite:/var/lib/vault.db`) and
    /// optional `table`.
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let url = conf.require("connection_url")?;
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| PhysicalError::Config(format!("invalid connection_url: {e}")))?
            .create_if_missing(true);
        let max_parallel = conf.max_parallel()?;
        let max_connections = if is_memory_url(url) { 1 } else { max_parallel.min(16) };
        Self::connect(options, max_connections as u32, &table_name(conf)?, max_parallel).await
    }

    /// Open or create a SQLite database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite backend at {:?}", path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, 5, DEFAULT_TABLE, 0).await
    }

    /// Create an in-memory SQLite backend (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| PhysicalError::ConnectionError(e.to_string()))?;
        Self::connect(options, 1, DEFAULT_TABLE, 0).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
        table: &str,
        max_parallel: usize,
    ) -> Result<Self> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| PhysicalError::ConnectionError(e.to_string()))?;

        let backend = Self {
            pool,
            table: table.to_string(),
            statements: Statements::new(table),
            permit_pool: PermitPool::new(max_parallel),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                path TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL
            )"#,
            self.table
        ))
        .execute(&self.pool)
        .await?;

        debug!(table = %self.table, "SQLite schema initialized");
        Ok(())
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("sqlite", "put");
        validate_key(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        sqlx::query(&self.statements.put)
            .bind(&entry.key)
            .bind(&entry.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("sqlite", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let row: Option<(Vec<u8>,)> = sqlx::query_as(&self.statements.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| Entry::new(key, value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("sqlite", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        sqlx::query(&self.statements.delete)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("sqlite", "list");
        let _permit = self.permit_pool.acquire().await?;

        let rows: Vec<(String,)> = sqlx::query_as(&self.statements.list)
            .bind(like_prefix(prefix))
            .fetch_all(&self.pool)
            .await?;
        Ok(list_segments(rows.into_iter().map(|(path,)| path), prefix))
    }

    async fn close(&self) -> Result<()> {
        self.permit_pool.close();
        self.pool.close().await;
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for SqliteBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("sqlite", "transaction");
        check_txns(&txns)?;
        let _permit = self.permit_pool.acquire().await?;

        // Dropping `tx` without commit rolls back.
        let mut tx = self.pool.begin().await?;
        for txn in &txns {
            match txn.operation {
                Operation::Put => {
                    sqlx::query(&self.statements.put)
                        .bind(&txn.entry.key)
                        .bind(&txn.entry.value)
                        .execute(&mut *tx)
                        .await?;
                }
                _ => {
                    sqlx::query(&self.statements.delete)
                        .bind(&txn.entry.key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
