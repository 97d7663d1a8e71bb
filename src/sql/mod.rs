//! Relational database drivers.
//!
//! Every dialect stores entries in one table with a `path` primary key and a
//! `value` byte column. Listing is a prefix `LIKE` scan followed by
//! [`list_segments`](crate::util::list_segments).

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mysql::MySqlBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::store::{validate_key, Operation, TxnEntry};

/// Table used when `table` is not configured.
pub const DEFAULT_TABLE: &str = "vault";

/// The configured table name, checked so it can be spliced into statements.
pub(crate) fn table_name(conf: &BackendConfig) -> Result<String> {
    let table = conf.get_or("table", DEFAULT_TABLE);
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PhysicalError::Config(format!("invalid table name: {table:?}")));
    }
    Ok(table.to_string())
}

/// A `LIKE` pattern matching every path starting with `prefix`.
///
/// `%`, `_` and `\` in the prefix are escaped with a backslash.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Reject anything but puts and deletes with valid keys before a database
/// transaction is opened.
pub(crate) fn check_txns(txns: &[TxnEntry]) -> Result<()> {
    for txn in txns {
        match txn.operation {
            Operation::Put | Operation::Delete => validate_key(&txn.entry.key)?,
            other => {
                return Err(PhysicalError::Unsupported(format!(
                    "operation {other} is not allowed in a transaction"
                )))
            }
        }
    }
    Ok(())
}
