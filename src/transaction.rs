//! Rollback-capable transactions for drivers without native atomic writes.
//!
//! The handler applies each entry in order, remembering how to undo it. On
//! the first failure it unwinds every applied entry in reverse. Atomic
//! visibility relies on the driver holding its whole permit pool for the
//! duration of the call.

use async_trait::async_trait;
use tracing::warn;

use crate::error::{PhysicalError, Result};
use crate::store::{Entry, Operation, TxnEntry};

/// Raw operations a driver exposes to the generic handler, bypassing its
/// permit pool.
#[async_trait]
pub trait PseudoTransactional: Send + Sync {
    async fn get_internal(&self, key: &str) -> Result<Option<Entry>>;

    async fn put_internal(&self, entry: Entry) -> Result<()>;

    async fn delete_internal(&self, key: &str) -> Result<()>;
}

/// Apply `txns` in order; on failure undo whatever was applied.
///
/// Rollback is best-effort: every inverse is attempted and each failure is
/// collected into [`PhysicalError::Rollback`] next to the original cause.
pub async fn generic_transaction_handler<T>(backend: &T, txns: Vec<TxnEntry>) -> Result<()>
where
    T: PseudoTransactional + ?Sized,
{
    let mut rollback_stack: Vec<TxnEntry> = Vec::with_capacity(txns.len());
    let mut failure: Option<PhysicalError> = None;

    for txn in txns {
        let step = apply_forward(backend, txn).await;
        match step {
            Ok(Some(inverse)) => rollback_stack.push(inverse),
            Ok(None) => {}
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let Some(cause) = failure else {
        return Ok(());
    };

    let mut rollback_errors = Vec::new();
    while let Some(inverse) = rollback_stack.pop() {
        let result = match inverse.operation {
            Operation::Put => backend.put_internal(inverse.entry).await,
            _ => backend.delete_internal(&inverse.entry.key).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "transaction rollback step failed");
            rollback_errors.push(err);
        }
    }

    if rollback_errors.is_empty() {
        Err(cause)
    } else {
        Err(PhysicalError::Rollback {
            cause: Box::new(cause),
            rollback: rollback_errors,
        })
    }
}

/// Apply one entry, returning the entry that undoes it (if any).
async fn apply_forward<T>(backend: &T, txn: TxnEntry) -> Result<Option<TxnEntry>>
where
    T: PseudoTransactional + ?Sized,
{
    match txn.operation {
        Operation::Delete => {
            let Some(previous) = backend.get_internal(&txn.entry.key).await? else {
                return Ok(None);
            };
            backend.delete_internal(&txn.entry.key).await?;
            Ok(Some(TxnEntry::put(previous)))
        }
        Operation::Put => {
            let previous = backend.get_internal(&txn.entry.key).await?;
            let key = txn.entry.key.clone();
            backend.put_internal(txn.entry).await?;
            Ok(Some(match previous {
                Some(entry) => TxnEntry::put(entry),
                None => TxnEntry::delete(key),
            }))
        }
        other => Err(PhysicalError::Unsupported(format!(
            "operation {other} is not allowed in a transaction"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore {
        data: Mutex<BTreeMap<String, Entry>>,
        fail_put: Option<&'static str>,
        fail_delete_after_error: bool,
    }

    #[async_trait]
    impl PseudoTransactional for MapStore {
        async fn get_internal(&self, key: &str) -> Result<Option<Entry>> {
            Ok(self.data.lock().get(key).cloned())
        }

        async fn put_internal(&self, entry: Entry) -> Result<()> {
            if self.fail_put == Some(entry.key.as_str()) {
                return Err(PhysicalError::ConnectionError(format!("put {}", entry.key)));
            }
            self.data.lock().insert(entry.key.clone(), entry);
            Ok(())
        }

        async fn delete_internal(&self, key: &str) -> Result<()> {
            if self.fail_delete_after_error {
                return Err(PhysicalError::ConnectionError(format!("delete {key}")));
            }
            self.data.lock().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_applies_in_order() {
        let store = MapStore::default();
        generic_transaction_handler(
            &store,
            vec![
                TxnEntry::put(Entry::new("k", b"v1".to_vec())),
                TxnEntry::put(Entry::new("k", b"v2".to_vec())),
                TxnEntry::delete("missing"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(store.data.lock().get("k").unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let store = MapStore {
            fail_put: Some("zip"),
            ..MapStore::default()
        };
        store.data.lock().insert("foo".into(), Entry::new("foo", b"bar".to_vec()));
        store.data.lock().insert("gone".into(), Entry::new("gone", b"x".to_vec()));

        let err = generic_transaction_handler(
            &store,
            vec![
                TxnEntry::put(Entry::new("foo", b"bar2".to_vec())),
                TxnEntry::delete("gone"),
                TxnEntry::put(Entry::new("new", b"n".to_vec())),
                TxnEntry::put(Entry::new("zip", b"zap3".to_vec())),
            ],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PhysicalError::ConnectionError(_)));

        let data = store.data.lock();
        assert_eq!(data.get("foo").unwrap().value, b"bar");
        assert_eq!(data.get("gone").unwrap().value, b"x");
        assert!(!data.contains_key("new"));
    }

    #[tokio::test]
    async fn test_rollback_errors_are_collected() {
        let store = MapStore {
            fail_put: Some("b"),
            fail_delete_after_error: true,
            ..MapStore::default()
        };

        let err = generic_transaction_handler(
            &store,
            vec![
                TxnEntry::put(Entry::new("a", b"1".to_vec())),
                TxnEntry::put(Entry::new("b", b"2".to_vec())),
            ],
        )
        .await
        .unwrap_err();

        match err {
            PhysicalError::Rollback { cause, rollback } => {
                assert!(cause.to_string().contains("put b"));
                assert_eq!(rollback.len(), 1);
                assert!(rollback[0].to_string().contains("delete a"));
            }
            other => panic!("expected rollback error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_read_operations() {
        let store = MapStore::default();
        let txn = TxnEntry {
            operation: Operation::Get,
            entry: Entry::new("a", Vec::new()),
        };
        let err = generic_transaction_handler(&store, vec![txn]).await.unwrap_err();
        assert!(matches!(err, PhysicalError::Unsupported(_)));
    }
}
