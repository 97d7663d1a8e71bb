//! The slice of the Consul HTTP API the driver uses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::error::{PhysicalError, Result};

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// A KV record as returned by `/v1/kv`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    #[serde(default, with = "crate::util::base64_bytes")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub modify_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KvVerb {
    Set,
    Delete,
}

/// One operation of a `/v1/txn` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvTxnOp {
    pub verb: KvVerb,
    pub key: String,
    #[serde(with = "crate::util::base64_bytes")]
    pub value: Vec<u8>,
    pub flags: u64,
}

#[derive(Serialize)]
struct TxnWrapper<'a> {
    #[serde(rename = "KV")]
    kv: &'a KvTxnOp,
}

/// Health of the registered service's TTL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub notes: String,
}

/// Body of `/v1/agent/service/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub check: ServiceCheck,
}

/// Consul operations, kept narrow so the driver can run against a double.
#[async_trait]
pub trait ConsulApi: Send + Sync {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>>;

    /// Blocking query: returns once the index moves past `index` or `wait`
    /// elapses, with the record and the new index.
    async fn kv_watch(&self, key: &str, index: u64, wait: Duration)
        -> Result<(Option<KvPair>, u64)>;

    async fn kv_put(&self, key: &str, value: &[u8], flags: u64) -> Result<()>;

    async fn kv_delete(&self, key: &str) -> Result<()>;

    /// Delete only if the record's modify index still equals `index`.
    async fn kv_delete_cas(&self, key: &str, index: u64) -> Result<bool>;

    /// Full keys under `prefix`, folded at the first '/' after it.
    async fn kv_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn kv_acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool>;

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool>;

    async fn txn(&self, ops: &[KvTxnOp]) -> Result<()>;

    async fn session_create(&self, name: &str, ttl: Duration) -> Result<String>;

    /// Returns false once the session no longer exists.
    async fn session_renew(&self, id: &str) -> Result<bool>;

    async fn session_destroy(&self, id: &str) -> Result<()>;

    async fn agent_self(&self) -> Result<serde_json::Value>;

    async fn service_register(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn service_deregister(&self, service_id: &str) -> Result<()>;

    async fn check_update(&self, check_id: &str, status: CheckStatus, output: &str) -> Result<()>;
}

/// [`ConsulApi`] over HTTP.
pub struct HttpConsul {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    datacenter: Option<String>,
}

impl HttpConsul {
    pub fn new(
        scheme: &str,
        address: &str,
        token: Option<String>,
        datacenter: Option<String>,
    ) -> Result<Self> {
        let base = Url::parse(&format!("{scheme}://{address}"))
            .map_err(|e| PhysicalError::Config(format!("invalid consul address: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PhysicalError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base,
            token,
            datacenter,
        })
    }

    fn url(&self, api: &[&str], key: &str) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| PhysicalError::Config("consul address cannot be a base".into()))?;
            segments.clear();
            segments.extend(api);
            if !key.is_empty() {
                segments.extend(key.split('/'));
            }
        }
        if let Some(dc) = &self.datacenter {
            url.query_pairs_mut().append_pair("dc", dc);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn bool_response(&self, resp: reqwest::Response) -> Result<bool> {
        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        Ok(body.trim() == "true")
    }
}

/// Map a non-success status onto the error taxonomy.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, body.trim()))
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> PhysicalError {
    let msg = format!("unexpected response code {}: {}", status.as_u16(), body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PhysicalError::ConnectionError(msg)
    } else if status == StatusCode::PAYLOAD_TOO_LARGE {
        PhysicalError::TooLarge {
            key: String::new(),
            size: 0,
            limit: super::MAX_VALUE_SIZE,
        }
    } else if status == StatusCode::CONFLICT {
        PhysicalError::ConnectionError(format!("transaction rolled back: {body}"))
    } else {
        PhysicalError::Protocol(msg)
    }
}

fn index_of(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ConsulApi for HttpConsul {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        let resp = self.request(Method::GET, self.url(&["v1", "kv"], key)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pairs: Vec<KvPair> = check_status(resp).await?.json().await?;
        Ok(pairs.into_iter().next())
    }

    async fn kv_watch(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Option<KvPair>, u64)> {
        let mut url = self.url(&["v1", "kv"], key)?;
        url.query_pairs_mut()
            .append_pair("index", &index.to_string())
            .append_pair("wait", &format!("{}ms", wait.as_millis()));
        let resp = self
            .request(Method::GET, url)
            .timeout(wait + Duration::from_secs(5))
            .send()
            .await?;
        let new_index = index_of(&resp);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((None, new_index));
        }
        let pairs: Vec<KvPair> = check_status(resp).await?.json().await?;
        Ok((pairs.into_iter().next(), new_index))
    }

    async fn kv_put(&self, key: &str, value: &[u8], flags: u64) -> Result<()> {
        let mut url = self.url(&["v1", "kv"], key)?;
        if flags != 0 {
            url.query_pairs_mut().append_pair("flags", &flags.to_string());
        }
        let resp = self.request(Method::PUT, url).body(value.to_vec()).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let resp = self.request(Method::DELETE, self.url(&["v1", "kv"], key)?).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn kv_delete_cas(&self, key: &str, index: u64) -> Result<bool> {
        let mut url = self.url(&["v1", "kv"], key)?;
        url.query_pairs_mut().append_pair("cas", &index.to_string());
        let resp = self.request(Method::DELETE, url).send().await?;
        self.bool_response(resp).await
    }

    async fn kv_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut url = self.url(&["v1", "kv"], prefix)?;
        url.query_pairs_mut()
            .append_pair("keys", "")
            .append_pair("separator", "/");
        let resp = self.request(Method::GET, url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(check_status(resp).await?.json().await?)
    }

    async fn kv_acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool> {
        let mut url = self.url(&["v1", "kv"], key)?;
        url.query_pairs_mut().append_pair("acquire", session);
        let resp = self.request(Method::PUT, url).body(value.to_vec()).send().await?;
        self.bool_response(resp).await
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool> {
        let mut url = self.url(&["v1", "kv"], key)?;
        url.query_pairs_mut().append_pair("release", session);
        let resp = self.request(Method::PUT, url).send().await?;
        self.bool_response(resp).await
    }

    async fn txn(&self, ops: &[KvTxnOp]) -> Result<()> {
        let body: Vec<TxnWrapper<'_>> = ops.iter().map(|kv| TxnWrapper { kv }).collect();
        let resp = self
            .request(Method::PUT, self.url(&["v1", "txn"], "")?)
            .json(&body)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn session_create(&self, name: &str, ttl: Duration) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            #[serde(rename = "ID")]
            id: String,
        }
        let body = serde_json::json!({
            "Name": name,
            "TTL": format!("{}s", ttl.as_secs().max(10)),
            "LockDelay": "15s",
            "Behavior": "release",
        });
        let resp = self
            .request(Method::PUT, self.url(&["v1", "session", "create"], "")?)
            .json(&body)
            .send()
            .await?;
        let created: Created = check_status(resp).await?.json().await?;
        Ok(created.id)
    }

    async fn session_renew(&self, id: &str) -> Result<bool> {
        let resp = self
            .request(Method::PUT, self.url(&["v1", "session", "renew", id], "")?)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(resp).await?;
        Ok(true)
    }

    async fn session_destroy(&self, id: &str) -> Result<()> {
        let resp = self
            .request(Method::PUT, self.url(&["v1", "session", "destroy", id], "")?)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn agent_self(&self) -> Result<serde_json::Value> {
        let resp = self
            .request(Method::GET, self.url(&["v1", "agent", "self"], "")?)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn service_register(&self, registration: &ServiceRegistration) -> Result<()> {
        let resp = self
            .request(Method::PUT, self.url(&["v1", "agent", "service", "register"], "")?)
            .json(registration)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> Result<()> {
        let url = self.url(&["v1", "agent", "service", "deregister", service_id], "")?;
        let resp = self.request(Method::PUT, url).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn check_update(&self, check_id: &str, status: CheckStatus, output: &str) -> Result<()> {
        let body = serde_json::json!({ "Status": status, "Output": output });
        let resp = self
            .request(Method::PUT, self.url(&["v1", "agent", "check", "update", check_id], "")?)
            .json(&body)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_pair_decode() {
        let raw = r#"[{"LockIndex":0,"Key":"vault/foo","Flags":1,"Value":"dGVzdA==","CreateIndex":5,"ModifyIndex":7}]"#;
        let pairs: Vec<KvPair> = serde_json::from_str(raw).unwrap();
        assert_eq!(pairs[0].key, "vault/foo");
        assert_eq!(pairs[0].value, b"test");
        assert_eq!(pairs[0].flags, 1);
        assert_eq!(pairs[0].modify_index, 7);
        assert!(pairs[0].session.is_none());
    }

    #[test]
    fn test_kv_pair_null_value() {
        let raw = r#"{"Key":"vault/empty","Value":null,"Session":"abc"}"#;
        let pair: KvPair = serde_json::from_str(raw).unwrap();
        assert!(pair.value.is_empty());
        assert_eq!(pair.session.as_deref(), Some("abc"));
    }

    #[test]
    fn test_txn_body() {
        let op = KvTxnOp {
            verb: KvVerb::Set,
            key: "vault/foo".into(),
            value: b"bar".to_vec(),
            flags: 0,
        };
        let body = serde_json::to_value(vec![TxnWrapper { kv: &op }]).unwrap();
        assert_eq!(
            body,
            serde_json::json!([{"KV": {"Verb": "set", "Key": "vault/foo", "Value": "YmFy", "Flags": 0}}])
        );
    }

    #[test]
    fn test_url_escapes_segments() {
        let api = HttpConsul::new("http", "127.0.0.1:8500", None, Some("dc1".into())).unwrap();
        let url = api.url(&["v1", "kv"], "vault/a b/c?d").unwrap();
        assert_eq!(url.path(), "/v1/kv/vault/a%20b/c%3Fd");
        assert_eq!(url.query(), Some("dc=dc1"));

        let folder = api.url(&["v1", "kv"], "vault/").unwrap();
        assert_eq!(folder.path(), "/v1/kv/vault/");
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "").is_retryable());
        assert!(matches!(
            status_error(StatusCode::PAYLOAD_TOO_LARGE, ""),
            PhysicalError::TooLarge { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "ACL not found"),
            PhysicalError::Protocol(_)
        ));
    }
}
