//! Reusable conformance suites every driver runs in its tests.
//!
//! Each suite leaves the backend empty when it passes.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::{Backend, Entry, TxnEntry};

const LOCK_WAIT: Duration = Duration::from_secs(15);

async fn put<B: Backend + ?Sized>(b: &B, key: &str, value: &str) {
    b.put(Entry::new(key, value.as_bytes().to_vec()))
        .await
        .unwrap_or_else(|e| panic!("put {key}: {e}"));
}

async fn value_of<B: Backend + ?Sized>(b: &B, key: &str) -> Option<Vec<u8>> {
    b.get(key)
        .await
        .unwrap_or_else(|e| panic!("get {key}: {e}"))
        .map(|e| e.value)
}

async fn list<B: Backend + ?Sized>(b: &B, prefix: &str) -> Vec<String> {
    b.list(prefix)
        .await
        .unwrap_or_else(|e| panic!("list {prefix:?}: {e}"))
}

/// Basic CRUD, idempotent delete and list hierarchy.
pub async fn exercise_backend<B: Backend + ?Sized>(b: &B) {
    assert!(list(b, "").await.is_empty(), "backend should start empty");

    b.delete("foo").await.expect("delete of missing key");
    assert_eq!(value_of(b, "foo").await, None);

    put(b, "foo", "test").await;
    let entry = b.get("foo").await.unwrap().expect("entry present");
    assert_eq!(entry.key, "foo");
    assert_eq!(entry.value, b"test");
    assert_eq!(list(b, "").await, vec!["foo"]);

    b.delete("foo").await.unwrap();
    b.delete("foo").await.unwrap();
    assert_eq!(value_of(b, "foo").await, None);
    assert!(list(b, "").await.is_empty());

    // Leaf and folder under the same name.
    put(b, "foo", "test").await;
    put(b, "foo/bar", "test").await;
    put(b, "foo/bar/baz", "test").await;
    assert_eq!(list(b, "").await, vec!["foo", "foo/"]);
    assert_eq!(list(b, "foo/").await, vec!["bar", "bar/"]);
    assert_eq!(list(b, "foo/bar/").await, vec!["baz"]);

    // Deleting the deepest leaf leaves its parent leaf alone.
    b.delete("foo/bar/baz").await.unwrap();
    assert_eq!(list(b, "foo/").await, vec!["bar"]);
    assert_eq!(value_of(b, "foo/bar").await.as_deref(), Some(&b"test"[..]));

    b.delete("foo/bar").await.unwrap();
    assert_eq!(list(b, "").await, vec!["foo"]);

    // Overwrite replaces the value.
    put(b, "foo", "second").await;
    assert_eq!(value_of(b, "foo").await.as_deref(), Some(&b"second"[..]));

    // Sibling survives removal of a nested leaf.
    put(b, "a/b/c", "1").await;
    put(b, "a/d", "2").await;
    assert_eq!(list(b, "a/").await, vec!["b/", "d"]);
    b.delete("a/b/c").await.unwrap();
    assert_eq!(list(b, "a/").await, vec!["d"]);

    // Keys are byte-exact.
    put(b, "Case", "upper").await;
    assert_eq!(value_of(b, "case").await, None);
    assert_eq!(value_of(b, "Case").await.as_deref(), Some(&b"upper"[..]));

    // Empty values are allowed.
    put(b, "empty", "").await;
    assert_eq!(value_of(b, "empty").await.as_deref(), Some(&b""[..]));

    for key in ["foo", "a/d", "Case", "empty"] {
        b.delete(key).await.unwrap();
    }
    assert!(list(b, "").await.is_empty(), "backend should end empty");
}

/// Prefix scoping: siblings sharing a string prefix must not leak in.
pub async fn exercise_backend_list_prefix<B: Backend + ?Sized>(b: &B) {
    put(b, "fo", "1").await;
    put(b, "foo/bar", "2").await;
    put(b, "foobar/baz", "3").await;
    put(b, "foo_x/y", "4").await;

    assert_eq!(list(b, "").await, vec!["fo", "foo/", "foo_x/", "foobar/"]);
    assert_eq!(list(b, "foo/").await, vec!["bar"]);
    assert_eq!(list(b, "foobar/").await, vec!["baz"]);
    assert_eq!(list(b, "foo_x/").await, vec!["y"]);
    assert!(list(b, "missing/").await.is_empty());

    for key in ["fo", "foo/bar", "foobar/baz", "foo_x/y"] {
        b.delete(key).await.unwrap();
    }
    assert!(list(b, "").await.is_empty());
}

/// Ordered, atomic transactions.
pub async fn exercise_transactional_backend<B: Backend + ?Sized>(b: &B) {
    let txn = b.as_transactional().expect("backend is transactional");

    put(b, "foo", "bar").await;
    put(b, "zip", "zap").await;
    put(b, "deleteme", "").await;
    put(b, "deleteme2", "").await;

    txn.transaction(vec![
        TxnEntry::put(Entry::new("foo", b"bar2".to_vec())),
        TxnEntry::delete("deleteme"),
        TxnEntry::put(Entry::new("foo", b"bar3".to_vec())),
        TxnEntry::delete("deleteme2"),
        TxnEntry::put(Entry::new("zip", b"zap3".to_vec())),
    ])
    .await
    .expect("transaction commits");

    assert_eq!(list(b, "").await, vec!["foo", "zip"]);
    assert_eq!(value_of(b, "foo").await.as_deref(), Some(&b"bar3"[..]));
    assert_eq!(value_of(b, "zip").await.as_deref(), Some(&b"zap3"[..]));

    txn.transaction(vec![
        TxnEntry::put(Entry::new("k", b"v1".to_vec())),
        TxnEntry::put(Entry::new("k", b"v2".to_vec())),
    ])
    .await
    .unwrap();
    assert_eq!(value_of(b, "k").await.as_deref(), Some(&b"v2"[..]));

    txn.transaction(vec![
        TxnEntry::delete("foo"),
        TxnEntry::delete("zip"),
        TxnEntry::delete("k"),
    ])
    .await
    .unwrap();
    assert!(list(b, "").await.is_empty());
}

/// Mutual exclusion and hand-off between two handles on the same key.
///
/// `b` and `b2` must share lock state (the same cluster, table or service).
pub async fn exercise_ha_backend<B, B2>(b: &B, b2: &B2)
where
    B: Backend + ?Sized,
    B2: Backend + ?Sized,
{
    let ha = b.as_ha().expect("first backend has HA");
    let ha2 = b2.as_ha().expect("second backend has HA");
    assert!(ha.ha_enabled());

    let lock = ha.lock_with("foo", "bar").unwrap();
    assert!(!lock.value().await.unwrap().0);

    let leader = tokio::time::timeout(LOCK_WAIT, lock.lock(CancellationToken::new()))
        .await
        .expect("first lock within timeout")
        .unwrap()
        .expect("first lock acquired");
    assert_eq!(lock.value().await.unwrap(), (true, "bar".to_string()));

    let lock2 = ha2.lock_with("foo", "baz").unwrap();
    assert_eq!(lock2.value().await.unwrap(), (true, "bar".to_string()));

    // A contended attempt gives up when stop fires.
    let stop = CancellationToken::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });
    assert!(lock2.lock(stop).await.unwrap().is_none());

    // A pre-cancelled stop returns immediately, even on a free key.
    let stopped = CancellationToken::new();
    stopped.cancel();
    let free = ha2.lock_with("free", "x").unwrap();
    let attempt = tokio::time::timeout(Duration::from_secs(1), free.lock(stopped))
        .await
        .expect("pre-cancelled lock returns promptly");
    assert!(attempt.unwrap().is_none());

    lock.unlock().await.unwrap();
    tokio::time::timeout(LOCK_WAIT, leader.lost())
        .await
        .expect("leader signal completes after unlock");

    let leader2 = tokio::time::timeout(LOCK_WAIT, lock2.lock(CancellationToken::new()))
        .await
        .expect("second lock within timeout")
        .unwrap()
        .expect("second lock acquired");
    assert!(!leader2.is_lost());
    assert_eq!(lock2.value().await.unwrap(), (true, "baz".to_string()));
    assert_eq!(lock.value().await.unwrap(), (true, "baz".to_string()));

    lock2.unlock().await.unwrap();
    lock2.unlock().await.unwrap();
    lock.unlock().await.unwrap();
}
