//! etcd v3 over its JSON gateway (`/v3/kv/*`, `/v3/lease/*`).
//!
//! Keys and values travel base64-encoded; 64-bit integers come back as
//! strings.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{PhysicalError, Result};

/// A stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KeyValue {
    #[serde(deserialize_with = "b64_string")]
    pub key: String,
    #[serde(default, with = "crate::util::base64_bytes")]
    pub value: Vec<u8>,
    #[serde(default, deserialize_with = "int_string")]
    pub create_revision: i64,
    #[serde(default, deserialize_with = "int_string")]
    pub mod_revision: i64,
    #[serde(default, deserialize_with = "int_string")]
    pub lease: i64,
}

/// One unconditional write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

fn b64(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

fn b64_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let bytes = STANDARD.decode(raw).map_err(serde::de::Error::custom)?;
    String::from_utf8(bytes).map_err(serde::de::Error::custom)
}

fn int_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("integer out of range")),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("expected integer, got {other}"))),
    }
}

/// The key just past every key starting with `prefix`.
pub(crate) fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Whole keyspace.
    vec![0]
}

pub(crate) fn txn_request(ops: &[TxnOp]) -> Value {
    let success: Vec<Value> = ops
        .iter()
        .map(|op| match op {
            TxnOp::Put { key, value } => json!({
                "request_put": {"key": b64(key.as_bytes()), "value": b64(value)}
            }),
            TxnOp::Delete { key } => json!({
                "request_delete_range": {"key": b64(key.as_bytes())}
            }),
        })
        .collect();
    json!({ "success": success })
}

/// etcd operations the driver relies on.
#[async_trait]
pub trait EtcdKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn put(&self, key: &str, value: &[u8], lease: Option<i64>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn txn(&self, ops: &[TxnOp]) -> Result<()>;

    /// Put only if the key does not exist. Returns whether it was written.
    async fn create_if_absent(&self, key: &str, value: &[u8], lease: i64) -> Result<bool>;

    /// Delete only if the key is attached to `lease`.
    async fn delete_if_lease(&self, key: &str, lease: i64) -> Result<bool>;

    async fn lease_grant(&self, ttl: Duration) -> Result<i64>;

    /// Returns false once the lease has expired.
    async fn lease_keep_alive(&self, lease: i64) -> Result<bool>;

    async fn lease_revoke(&self, lease: i64) -> Result<()>;
}

/// [`EtcdKv`] over HTTP, trying each endpoint in turn.
pub struct HttpEtcd {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

impl HttpEtcd {
    pub fn new(
        endpoints: &[String],
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(PhysicalError::NotReady("no etcd endpoints configured".into()));
        }
        let endpoints = endpoints
            .iter()
            .map(|e| {
                Url::parse(e).map_err(|err| PhysicalError::Config(format!("invalid etcd address {e:?}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PhysicalError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoints,
            credentials,
            token: RwLock::new(None),
        })
    }

    async fn authenticate(&self, endpoint: &Url) -> Result<()> {
        let Some((name, password)) = &self.credentials else {
            return Ok(());
        };
        let url = endpoint
            .join("v3/auth/authenticate")
            .map_err(|e| PhysicalError::Config(e.to_string()))?;
        let resp = self
            .client
            .post(url)
            .json(&json!({"name": name, "password": password}))
            .send()
            .await?;
        let body: Value = check_status(resp).await?.json().await?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| PhysicalError::Protocol("authenticate response has no token".into()))?;
        *self.token.write() = Some(token.to_string());
        Ok(())
    }

    /// POST `body` to `api`, failing over between endpoints on transport
    /// errors.
    async fn call(&self, api: &str, body: &Value) -> Result<Value> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            if self.credentials.is_some() && self.token.read().is_none() {
                if let Err(e) = self.authenticate(endpoint).await {
                    last_err = Some(e);
                    continue;
                }
            }
            let url = endpoint
                .join(api)
                .map_err(|e| PhysicalError::Config(e.to_string()))?;
            let mut req = self.client.post(url).json(body);
            let token = self.token.read().clone();
            if let Some(token) = token {
                req = req.header("Authorization", token);
            }
            match req.send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::UNAUTHORIZED {
                        *self.token.write() = None;
                    }
                    return Ok(check_status(resp).await?.json().await?);
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "etcd endpoint failed");
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PhysicalError::NotReady("no etcd endpoints".into())))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let msg = format!("etcd returned {}: {}", status.as_u16(), body.trim());
    if status.is_server_error() || status == StatusCode::UNAUTHORIZED {
        Err(PhysicalError::ConnectionError(msg))
    } else if body.contains("request is too large") {
        Err(PhysicalError::TooLarge {
            key: String::new(),
            size: 0,
            limit: 0,
        })
    } else if body.contains("too many operations in txn request") {
        Err(PhysicalError::TooManyStatements {
            count: 0,
            limit: super::MAX_TXN_OPS,
        })
    } else {
        Err(PhysicalError::Protocol(msg))
    }
}

fn kvs(body: Value) -> Result<Vec<KeyValue>> {
    match body.get("kvs") {
        Some(kvs) => Ok(serde_json::from_value(kvs.clone())?),
        None => Ok(Vec::new()),
    }
}

fn succeeded(body: &Value) -> bool {
    body.get("succeeded").and_then(Value::as_bool).unwrap_or(false)
}

#[async_trait]
impl EtcdKv for HttpEtcd {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let body = self
            .call("v3/kv/range", &json!({"key": b64(key.as_bytes())}))
            .await?;
        Ok(kvs(body)?.into_iter().next())
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<i64>) -> Result<()> {
        let mut req = json!({"key": b64(key.as_bytes()), "value": b64(value)});
        if let Some(lease) = lease {
            req["lease"] = json!(lease.to_string());
        }
        self.call("v3/kv/put", &req).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.call("v3/kv/deleterange", &json!({"key": b64(key.as_bytes())}))
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let body = self
            .call(
                "v3/kv/range",
                &json!({
                    "key": b64(prefix.as_bytes()),
                    "range_end": b64(&prefix_end(prefix)),
                    "keys_only": true,
                }),
            )
            .await?;
        Ok(kvs(body)?.into_iter().map(|kv| kv.key).collect())
    }

    async fn txn(&self, ops: &[TxnOp]) -> Result<()> {
        self.call("v3/kv/txn", &txn_request(ops)).await?;
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], lease: i64) -> Result<bool> {
        let key = b64(key.as_bytes());
        let body = self
            .call(
                "v3/kv/txn",
                &json!({
                    "compare": [{"key": key, "target": "CREATE", "result": "EQUAL", "create_revision": "0"}],
                    "success": [{"request_put": {"key": key, "value": b64(value), "lease": lease.to_string()}}],
                }),
            )
            .await?;
        Ok(succeeded(&body))
    }

    async fn delete_if_lease(&self, key: &str, lease: i64) -> Result<bool> {
        let key = b64(key.as_bytes());
        let body = self
            .call(
                "v3/kv/txn",
                &json!({
                    "compare": [{"key": key, "target": "LEASE", "result": "EQUAL", "lease": lease.to_string()}],
                    "success": [{"request_delete_range": {"key": key}}],
                }),
            )
            .await?;
        Ok(succeeded(&body))
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<i64> {
        #[derive(Deserialize)]
        struct Granted {
            #[serde(rename = "ID", deserialize_with = "int_string")]
            id: i64,
        }
        let body = self
            .call("v3/lease/grant", &json!({"TTL": ttl.as_secs().max(1).to_string()}))
            .await?;
        let granted: Granted = serde_json::from_value(body)?;
        Ok(granted.id)
    }

    async fn lease_keep_alive(&self, lease: i64) -> Result<bool> {
        #[derive(Deserialize)]
        struct Kept {
            #[serde(rename = "TTL", default, deserialize_with = "int_string")]
            ttl: i64,
        }
        let body = self
            .call("v3/lease/keepalive", &json!({"ID": lease.to_string()}))
            .await?;
        // The gateway wraps streamed responses in {"result": ...}.
        let inner = body.get("result").cloned().unwrap_or(body);
        let kept: Kept = serde_json::from_value(inner)?;
        Ok(kept.ttl > 0)
    }

    async fn lease_revoke(&self, lease: i64) -> Result<()> {
        self.call("v3/lease/revoke", &json!({"ID": lease.to_string()}))
            .await?;
        Ok(())
    }
}
