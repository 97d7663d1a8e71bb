//! PostgreSQL backend.
//!
//! Servers from 9.5 on use `INSERT .. ON CONFLICT DO UPDATE`. Older servers
//! get a `vault_kv_put` plpgsql function that loops UPDATE-then-INSERT and
//! retries on a unique violation.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::{check_txns, like_prefix, table_name};
use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry, Operation, Transactional, TxnEntry};
use crate::telemetry::measure;
use crate::util::list_segments;

/// First `server_version_num` with native upsert.
const NATIVE_UPSERT_VERSION: i32 = 90500;

/// How `put` writes a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStyle {
    OnConflict,
    StoredProcedure,
}

impl UpsertStyle {
    pub fn for_server_version(version_num: i32) -> Self {
        if version_num >= NATIVE_UPSERT_VERSION {
            UpsertStyle::OnConflict
        } else {
            UpsertStyle::StoredProcedure
        }
    }
}

#[derive(Debug)]
struct Statements {
    put: String,
    get: String,
    delete: String,
    list: String,
}

impl Statements {
    fn new(table: &str, style: UpsertStyle) -> Self {
        let put = match style {
            UpsertStyle::OnConflict => format!(
                r#"INSERT INTO "{table}" (path, value) VALUES ($1, $2)
                ON CONFLICT (path) DO UPDATE SET value = EXCLUDED.value"#
            ),
            UpsertStyle::StoredProcedure => "SELECT vault_kv_put($1, $2)".to_string(),
        };
        Self {
            put,
            get: format!(r#"SELECT value FROM "{table}" WHERE path = $1"#),
            delete: format!(r#"DELETE FROM "{table}" WHERE path = $1"#),
            list: format!(
                r#"SELECT path FROM "{table}" WHERE path LIKE $1 ESCAPE '\' ORDER BY path"#
            ),
        }
    }
}

/// The plpgsql upsert used on servers without `ON CONFLICT`.
fn upsert_function(table: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION vault_kv_put(_path TEXT, _value BYTEA) RETURNS VOID AS
$$
BEGIN
    LOOP
        UPDATE "{table}" SET value = _value WHERE path = _path;
        IF found THEN
            RETURN;
        END IF;
        BEGIN
            INSERT INTO "{table}" (path, value) VALUES (_path, _value);
            RETURN;
        EXCEPTION WHEN unique_violation THEN
        END;
    END LOOP;
END;
$$
LANGUAGE plpgsql"#
    )
}

/// PostgreSQL implementation of Backend.
pub struct PostgresBackend {
    pool: PgPool,
    statements: Statements,
    permit_pool: PermitPool,
}

impl PostgresBackend {
    /// Connect using `connection_url`, creating the table on first use.
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let url = conf.require("connection_url")?;
        let table = table_name(conf)?;
        let max_parallel = conf.max_parallel()?;
        info!(table = %table, "Opening PostgreSQL backend");

        let pool = PgPoolOptions::new()
            .max_connections(max_parallel as u32)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| PhysicalError::ConnectionError(e.to_string()))?;

        let (version_num,): (i32,) =
            sqlx::query_as("SELECT current_setting('server_version_num')::int")
                .fetch_one(&pool)
                .await?;
        let style = UpsertStyle::for_server_version(version_num);
        debug!(version_num, ?style, "detected PostgreSQL upsert support");

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                path TEXT COLLATE "C" PRIMARY KEY,
                value BYTEA NOT NULL
            )"#
        ))
        .execute(&pool)
        .await?;
        if style == UpsertStyle::StoredProcedure {
            sqlx::query(&upsert_function(&table)).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            statements: Statements::new(&table, style),
            permit_pool: PermitPool::new(max_parallel),
        })
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("postgres", "put");
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
        let _timer = measure("postgres", "get");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let row: Option<(Vec<u8>,)> = sqlx::query_as(&self.statements.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| Entry::new(key, value)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("postgres", "delete");
        validate_key(key)?;
        let _permit = self.permit_pool.acquire().await?;

        sqlx::query(&self.statements.delete)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("postgres", "list");
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
impl Transactional for PostgresBackend {
    async fn transaction(&self, txns: Vec<TxnEntry>) -> Result<()> {
        let _timer = measure("postgres", "transaction");
        check_txns(&txns)?;
        let _permit = self.permit_pool.acquire().await?;

        let mut tx = self.pool.begin().await?;
        for txn in &txns {
            if txn.operation == Operation::Put {
                sqlx::query(&self.statements.put)
                    .bind(&txn.entry.key)
                    .bind(&txn.entry.value)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(&self.statements.delete)
                    .bind(&txn.entry.key)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
