//! Log entry commands, JSON-encoded with a `type` tag.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One write inside a `kv.txn` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TxnCommand {
    Set {
        key: String,
        #[serde(with = "crate::util::base64_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
}

/// A replicated state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "kv.set")]
    KvSet {
        key: String,
        #[serde(with = "crate::util::base64_bytes")]
        value: Vec<u8>,
    },
    #[serde(rename = "kv.delete")]
    KvDelete { key: String },
    #[serde(rename = "kv.txn")]
    KvTxn { ops: Vec<TxnCommand> },
    #[serde(rename = "ha.try_lock")]
    TryLock {
        key: String,
        holder: String,
        ttl_ns: i64,
        time_ns: i64,
    },
    #[serde(rename = "ha.release_lock")]
    ReleaseLock { key: String, holder: String },
    #[serde(rename = "ha.release_stale")]
    ReleaseStale { time_ns: i64 },
    #[serde(rename = "ha.refresh_lock")]
    RefreshLock {
        key: String,
        holder: String,
        time_ns: i64,
    },
}

impl Command {
    /// The key a size error is reported against.
    pub fn subject(&self) -> &str {
        match self {
            Command::KvSet { key, .. }
            | Command::KvDelete { key }
            | Command::TryLock { key, .. }
            | Command::ReleaseLock { key, .. }
            | Command::RefreshLock { key, .. } => key,
            Command::KvTxn { .. } => "kv.txn",
            Command::ReleaseStale { .. } => "ha.release_stale",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::KvSet { key, .. } => write!(f, "kv.set {key}"),
            Command::KvDelete { key } => write!(f, "kv.delete {key}"),
            Command::KvTxn { ops } => write!(f, "kv.txn ({} ops)", ops.len()),
            Command::TryLock { key, holder, .. } => write!(f, "ha.try_lock {key} by {holder}"),
            Command::ReleaseLock { key, holder } => write!(f, "ha.release_lock {key} by {holder}"),
            Command::ReleaseStale { time_ns } => write!(f, "ha.release_stale at {time_ns}"),
            Command::RefreshLock { key, holder, .. } => {
                write!(f, "ha.refresh_lock {key} by {holder}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags() {
        let json = serde_json::to_string(&Command::KvSet {
            key: "a".into(),
            value: b"v".to_vec(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"kv.set","key":"a","value":"dg=="}"#);

        let json = serde_json::to_string(&Command::ReleaseStale { time_ns: 5 }).unwrap();
        assert_eq!(json, r#"{"type":"ha.release_stale","time_ns":5}"#);

        let cmd: Command = serde_json::from_str(
            r#"{"type":"kv.txn","ops":[{"op":"set","key":"a","value":""},{"op":"delete","key":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::KvTxn {
                ops: vec![
                    TxnCommand::Set {
                        key: "a".into(),
                        value: Vec::new()
                    },
                    TxnCommand::Delete { key: "b".into() },
                ]
            }
        );
    }

    #[test]
    fn test_subject_and_display() {
        let cmd = Command::TryLock {
            key: "core/lock".into(),
            holder: "node-a".into(),
            ttl_ns: 1,
            time_ns: 2,
        };
        assert_eq!(cmd.subject(), "core/lock");
        assert_eq!(cmd.to_string(), "ha.try_lock core/lock by node-a");
        assert_eq!(Command::KvTxn { ops: Vec::new() }.subject(), "kv.txn");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"type":"kv.frobnicate","key":"a"}"#).is_err());
    }
}
