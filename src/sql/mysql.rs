//! MySQL backend.
//!
//! Paths are stored as `VARBINARY` so comparisons stay byte-exact regardless
//! of the server's default collation.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::info;

use super::{check_txns, like_prefix, table_name};
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
                "INSERT INTO `{table}` (path, value) VALUES (?, ?) \
                 ON DUPLICATE KEY UPDATE value = VALUES(value)"
            ),
            get: format!("SELECT value FROM `{table}` WHERE path = ?"),
            delete: format!("DELETE FROM `{table}` WHERE path = ?"),
            // Backslash is MySQL's default LIKE escape.
            list: format!("SELECT path FROM `{table}` WHERE path LIKE ? ORDER BY path"),
        }
    }
}

/// MySQL implementation of Backend.
pub struct MySqlBackend {
    pool: MySqlPool,
    statements: Statements,
    permit_pool: PermitPool,
}

impl MySqlBackend {
    /// Connect using `connection_url` (database included), creating the
    /// table on first use.
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let url = conf.require("connection_url")?;
        let table = table_name(conf)?;
        let max_parallel = conf.max_parallel()?;
        info!(table = %table, "Opening MySQL backend");

        let pool = MySqlPoolOptions::new()
            .max_connections(max_parallel as u32)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| PhysicalError::ConnectionError(e.to_string()))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS `{table}` (\
                path VARBINARY(512) NOT NULL, \
                value MEDIUMBLOB, \
                PRIMARY KEY (path))"
        ))
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            statements: Statements::new(&table),
            permit_pool: PermitPool::new(max_parallel),
        })
    }
}

fn path_from_bytes(raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw).map_err(|e| PhysicalError::Protocol(format!("non UTF-8 path: {e}")))
}

#[async_trait]
impl Backend for MySqlBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("mysql", "put");
        validate_key(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        sqlx::query(&self.statements.put)
            .bind(entry.key.as_bytes())
            .bind(&entry.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("mysql", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let row: Option<(Option<Vec<u8>>,)> = sqlx::query_as(&self.statements.get)
            .bind(key.as_bytes())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| Entry::new(key, value.unwrap_or_default())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("mysql", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        sqlx::query(&self.statements.delete)
            .bind(key.as_bytes())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("mysql", "list");
        let _permit = self.permit_pool.acquire().await?;

        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(&self.statements.list)
            .bind(like_prefix(prefix).into_bytes())
            .fetch_all(&self.pool)
            .await?;
        let paths = rows
            .into_iter()
            .map(|(raw,)| path_from_bytes(raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(list_segments(paths, prefix))
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
impl Transactional for MySqlBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("mysql", "transaction");
        check_txns(&txns)?;
        let _permit = self.permit_pool.acquire().await?;

        let mut tx = self.pool.begin().await?;
        for txn in &txns {
            if txn.operation == Operation::Put {
                sqlx::query(&self.statements.put)
                    .bind(txn.entry.key.as_bytes())
                    .bind(&txn.entry.value)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(&self.statements.delete)
                    .bind(txn.entry.key.as_bytes())
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
