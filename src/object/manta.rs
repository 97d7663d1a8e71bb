//! Joyent Manta driver.
//!
//! Manta has real directories, so a value cannot share a name with one.
//! The value of `k` is stored at `<root>/k/.vault_value`, which lets `k`
//! hold both a value and children; `list` reports `name` for a directory
//! holding the marker and `name/` for one holding anything else. Parent
//! directories are created on demand and pruned once empty.
//!
//! Every request is signed: an rsa-sha256 signature over the `date`
//! header, sent as `Authorization: Signature keyId="/<user>/keys/<id>",...`.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{PhysicalError, Result};
use crate::permit::PermitPool;
use crate::store::{validate_key, Backend, Entry};
use crate::telemetry::measure;

/// Name of the child object holding a value.
pub const VALUE_MARKER: &str = ".vault_value";

const DEFAULT_URL: &str = "https://us-east.manta.joyent.com";
const DEFAULT_DIRECTORY: &str = "vault";
const DIRECTORY_TYPE: &str = "application/json; type=directory";
const LIST_LIMIT: usize = 1000;

/// Signs requests with the account's RSA key.
pub struct MantaSigner {
    key_id: String,
    key: SigningKey<Sha256>,
}

impl MantaSigner {
    /// `fingerprint` names the key registered with the account; `pem` is
    /// the PKCS#1 or PKCS#8 private key.
    pub fn new(user: &str, subuser: Option<&str>, fingerprint: &str, pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| PhysicalError::Config(format!("manta: unreadable private key: {e}")))?;
        let key_id = match subuser {
            Some(subuser) => format!("/{user}/users/{subuser}/keys/{fingerprint}"),
            None => format!("/{user}/keys/{fingerprint}"),
        };
        Ok(Self {
            key_id,
            key: SigningKey::new(key),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The `Authorization` header value for a request carrying `date`.
    pub fn authorization(&self, date: &str) -> String {
        let signature = self.key.sign(format!("date: {date}").as_bytes());
        format!(
            "Signature keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\"{}\"",
            self.key_id,
            STANDARD.encode(signature.to_bytes())
        )
    }
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, Deserialize)]
struct DirEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

impl DirEntry {
    fn is_dir(&self) -> bool {
        self.kind == "directory"
    }
}

/// Manta implementation of Backend.
pub struct MantaBackend {
    client: Client,
    base: Url,
    /// `/<user>/stor/<directory>`
    root: String,
    signer: MantaSigner,
    permit_pool: PermitPool,
}

async fn key_material(raw: &str) -> Result<String> {
    if raw.trim_start().starts_with("-----BEGIN") {
        return Ok(raw.to_string());
    }
    tokio::fs::read_to_string(Path::new(raw))
        .await
        .map_err(|e| PhysicalError::Config(format!("manta: reading key material {raw}: {e}")))
}

impl MantaBackend {
    /// `user`, `key_id` and `key_material` (a PEM private key or a path to
    /// one) are required, from the map or `MANTA_USER`, `MANTA_KEY_ID`,
    /// `MANTA_KEY_MATERIAL`. `url` (`MANTA_URL`), `subuser`
    /// (`MANTA_SUBUSER`) and `directory` are optional.
    pub async fn new(conf: &BackendConfig) -> Result<Self> {
        let user = conf.require_or_env("user", "MANTA_USER")?;
        let fingerprint = conf.require_or_env("key_id", "MANTA_KEY_ID")?;
        let material = conf.require_or_env("key_material", "MANTA_KEY_MATERIAL")?;
        let subuser = conf.get_or_env("subuser", "MANTA_SUBUSER");
        let url = conf
            .get_or_env("url", "MANTA_URL")
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let base = Url::parse(&url)
            .map_err(|e| PhysicalError::Config(format!("manta: invalid url {url:?}: {e}")))?;

        let pem = key_material(&material).await?;
        let signer = MantaSigner::new(&user, subuser.as_deref(), &fingerprint, &pem)?;
        let backend = Self::with_signer(
            base,
            &user,
            conf.get_or("directory", DEFAULT_DIRECTORY),
            signer,
            conf.max_parallel()?,
        )?;
        info!(url = %backend.base, root = %backend.root, key_id = %backend.signer.key_id(), "Opened Manta backend");
        Ok(backend)
    }

    pub fn with_signer(
        base: Url,
        user: &str,
        directory: &str,
        signer: MantaSigner,
        max_parallel: usize,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| PhysicalError::Config(format!("manta: building http client: {e}")))?;
        Ok(Self {
            client,
            base,
            root: format!("/{user}/stor/{}", directory.trim_matches('/')),
            signer,
            permit_pool: PermitPool::new(max_parallel),
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut url = self.base.clone();
        url.set_path(path);
        let date = http_date();
        self.client
            .request(method, url)
            .header(DATE, &date)
            .header(AUTHORIZATION, self.signer.authorization(&date))
    }

    fn dir_path(&self, dir: &str) -> String {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{dir}", self.root)
        }
    }

    fn object_path(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        if key.split('/').any(|seg| seg == "." || seg == "..") {
            return Err(PhysicalError::InvalidKey(format!(
                "path cannot contain '.' or '..' segments: {key}"
            )));
        }
        Ok(format!("{}/{key}/{VALUE_MARKER}", self.root))
    }

    /// Create `dir` and every missing parent below `/<user>/stor`.
    async fn mkdirs(&self, dir: &str) -> Result<()> {
        let mut segments = dir.trim_start_matches('/').split('/');
        let (Some(user), Some(stor)) = (segments.next(), segments.next()) else {
            return Err(PhysicalError::Protocol(format!("manta: not a storage path: {dir}")));
        };
        let mut path = format!("/{user}/{stor}");
        for segment in segments {
            path.push('/');
            path.push_str(segment);
            self.request(Method::PUT, &path)
                .header(CONTENT_TYPE, DIRECTORY_TYPE)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn put_object(&self, path: &str, value: &[u8]) -> Result<Response> {
        Ok(self
            .request(Method::PUT, path)
            .body(value.to_vec())
            .send()
            .await?)
    }

    /// Every entry of directory `path`, or None when it does not exist.
    async fn list_dir(&self, path: &str) -> Result<Option<Vec<DirEntry>>> {
        let mut entries: Vec<DirEntry> = Vec::new();
        loop {
            let mut req = self
                .request(Method::GET, path)
                .query(&[("limit", LIST_LIMIT.to_string())]);
            if let Some(last) = entries.last() {
                req = req.query(&[("marker", last.name.as_str())]);
            }
            let resp = req.send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let body = resp.error_for_status()?.text().await?;
            let marker = entries.last().map(|e| e.name.clone());
            let mut page = 0;
            for line in body.lines().filter(|l| !l.trim().is_empty()) {
                let entry: DirEntry = serde_json::from_str(line)?;
                page += 1;
                if marker.as_deref() == Some(entry.name.as_str()) {
                    continue;
                }
                entries.push(entry);
            }
            if page < LIST_LIMIT {
                return Ok(Some(entries));
            }
        }
    }

    /// Remove `dir` and its parents while they are empty, stopping at root.
    async fn prune(&self, mut dir: String) -> Result<()> {
        while dir.len() > self.root.len() && dir.starts_with(&self.root) {
            match self.list_dir(&dir).await? {
                Some(entries) if entries.is_empty() => {}
                _ => return Ok(()),
            }
            let resp = self.request(Method::DELETE, &dir).send().await?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                // Someone wrote below it in the meantime.
                warn!(dir = %dir, status = %resp.status(), "manta: could not remove directory");
                return Ok(());
            }
            debug!(dir = %dir, "manta: removed empty directory");
            match dir.rfind('/') {
                Some(i) => dir.truncate(i),
                None => return Ok(()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MantaBackend {
    async fn put(&self, entry: Entry) -> Result<()> {
        let _timer = measure("manta", "put");
        let path = self.object_path(&entry.key)?;
        let _permit = self.permit_pool.acquire().await?;

        let resp = self.put_object(&path, &entry.value).await?;
        if resp.status() != StatusCode::NOT_FOUND {
            resp.error_for_status()?;
            return Ok(());
        }
        // The parent directory is missing.
        let parent = path.trim_end_matches(VALUE_MARKER).trim_end_matches('/');
        self.mkdirs(parent).await?;
        self.put_object(&path, &entry.value)
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _timer = measure("manta", "get");
        let path = self.object_path(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let resp = self.request(Method::GET, &path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = resp.error_for_status()?.bytes().await?;
        Ok(Some(Entry::new(key, value.to_vec())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _timer = measure("manta", "delete");
        let path = self.object_path(key)?;
        let _permit = self.permit_pool.acquire().await?;

        let resp = self.request(Method::DELETE, &path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        self.prune(self.dir_path(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _timer = measure("manta", "list");
        let _permit = self.permit_pool.acquire().await?;

        let (dir, partial) = match prefix.rfind('/') {
            Some(i) => prefix.split_at(i + 1),
            None => ("", prefix),
        };
        let Some(entries) = self.list_dir(&self.dir_path(dir)).await? else {
            return Ok(Vec::new());
        };

        let mut names = Vec::new();
        for entry in entries.iter().filter(|e| e.is_dir()) {
            let Some(rest) = entry.name.strip_prefix(partial).filter(|r| !r.is_empty()) else {
                continue;
            };
            let inner = self
                .list_dir(&format!("{}/{}", self.dir_path(dir), entry.name))
                .await?
                .unwrap_or_default();
            if inner.iter().any(|c| c.name == VALUE_MARKER) {
                names.push(rest.to_string());
            }
            if inner.iter().any(|c| c.name != VALUE_MARKER) {
                names.push(format!("{rest}/"));
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{exercise_backend, exercise_backend_list_prefix};
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Uri};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::Router;
    use parking_lot::Mutex;
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::signature::Verifier;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    enum Node {
        Dir,
        Object(Vec<u8>),
    }

    /// Manta's storage API over a path map, checking every signature.
    struct FakeManta {
        nodes: Mutex<BTreeMap<String, Node>>,
        key_id: String,
        verifier: VerifyingKey<Sha256>,
    }

    impl FakeManta {
        fn authorized(&self, headers: &HeaderMap) -> bool {
            let (Some(date), Some(auth)) = (
                headers.get(DATE).and_then(|v| v.to_str().ok()),
                headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            ) else {
                return false;
            };
            let prefix = format!(
                "Signature keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\"",
                self.key_id
            );
            let Some(encoded) = auth.strip_prefix(&prefix).and_then(|s| s.strip_suffix('"'))
            else {
                return false;
            };
            let Ok(raw) = STANDARD.decode(encoded) else {
                return false;
            };
            let Ok(signature) = Signature::try_from(raw.as_slice()) else {
                return false;
            };
            self.verifier
                .verify(format!("date: {date}").as_bytes(), &signature)
                .is_ok()
        }

        fn parent_exists(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
            match path.rfind('/') {
                Some(i) => matches!(nodes.get(&path[..i]), Some(Node::Dir)),
                None => false,
            }
        }

        fn children<'a>(
            nodes: &'a BTreeMap<String, Node>,
            dir: &'a str,
        ) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
            nodes.iter().filter_map(move |(path, node)| {
                let name = path.strip_prefix(dir)?.strip_prefix('/')?;
                (!name.contains('/')).then_some((name, node))
            })
        }

        fn listing(nodes: &BTreeMap<String, Node>, dir: &str, query: &str) -> String {
            let mut limit = usize::MAX;
            let mut marker = None;
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("limit", v)) => limit = v.parse().unwrap_or(usize::MAX),
                    Some(("marker", v)) => marker = Some(v.to_string()),
                    _ => {}
                }
            }
            Self::children(nodes, dir)
                .filter(|(name, _)| marker.as_deref().map_or(true, |m| *name > m))
                .take(limit)
                .map(|(name, node)| {
                    let kind = match node {
                        Node::Dir => "directory",
                        Node::Object(_) => "object",
                    };
                    format!("{}\n", serde_json::json!({"name": name, "type": kind}))
                })
                .collect()
        }
    }

    async fn handle(
        State(fake): State<Arc<FakeManta>>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        if !fake.authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, "InvalidSignature").into_response();
        }
        let path = uri.path().trim_end_matches('/').to_string();
        let mut nodes = fake.nodes.lock();
        if method == Method::PUT {
            if !FakeManta::parent_exists(&nodes, &path) {
                return (StatusCode::NOT_FOUND, "DirectoryDoesNotExist").into_response();
            }
            let is_dir =
                headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) == Some(DIRECTORY_TYPE);
            if is_dir {
                nodes.entry(path).or_insert(Node::Dir);
            } else {
                nodes.insert(path, Node::Object(body.to_vec()));
            }
            StatusCode::NO_CONTENT.into_response()
        } else if method == Method::GET {
            match nodes.get(&path) {
                Some(Node::Object(value)) => (StatusCode::OK, value.clone()).into_response(),
                Some(Node::Dir) => {
                    let query = uri.query().unwrap_or_default();
                    (StatusCode::OK, FakeManta::listing(&nodes, &path, query)).into_response()
                }
                None => (StatusCode::NOT_FOUND, "ResourceNotFound").into_response(),
            }
        } else if method == Method::DELETE {
            let non_empty = match nodes.get(&path) {
                None => return (StatusCode::NOT_FOUND, "ResourceNotFound").into_response(),
                Some(Node::Dir) => FakeManta::children(&nodes, &path).next().is_some(),
                Some(Node::Object(_)) => false,
            };
            if non_empty {
                return (StatusCode::BAD_REQUEST, "DirectoryNotEmpty").into_response();
            }
            nodes.remove(&path);
            StatusCode::NO_CONTENT.into_response()
        } else {
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        }
    }

    /// Start a fake for `alice` and return a backend signed with alice's key,
    /// plus the fake to inspect.
    async fn start(directory: &str) -> (MantaBackend, Arc<FakeManta>) {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let signer = MantaSigner::new("alice", None, "a1:b2:c3", &pem).unwrap();

        let fake = Arc::new(FakeManta {
            nodes: Mutex::new(BTreeMap::from([
                ("/alice".to_string(), Node::Dir),
                ("/alice/stor".to_string(), Node::Dir),
            ])),
            key_id: signer.key_id().to_string(),
            verifier: VerifyingKey::new(key.to_public_key()),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(fake.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let base = Url::parse(&format!("http://{addr}")).unwrap();
        let backend = MantaBackend::with_signer(base, "alice", directory, signer, 0).unwrap();
        (backend, fake)
    }

    #[tokio::test]
    async fn test_manta_conformance() {
        let (b, _) = start("vault").await;
        exercise_backend(&b).await;
        exercise_backend_list_prefix(&b).await;
    }

    #[tokio::test]
    async fn test_value_stored_under_marker() {
        let (b, fake) = start("/vault/").await;
        assert_eq!(b.root(), "/alice/stor/vault");
        b.put(Entry::new("dir", b"1".to_vec())).await.unwrap();
        b.put(Entry::new("dir/child", b"2".to_vec())).await.unwrap();
        {
            let nodes = fake.nodes.lock();
            assert!(matches!(
                nodes.get("/alice/stor/vault/dir/.vault_value"),
                Some(Node::Object(v)) if v == b"1"
            ));
            assert!(matches!(nodes.get("/alice/stor/vault/dir/child"), Some(Node::Dir)));
        }
        assert_eq!(b.list("").await.unwrap(), vec!["dir", "dir/"]);
        assert_eq!(b.list("d").await.unwrap(), vec!["ir", "ir/"]);
        assert_eq!(b.list("dir/").await.unwrap(), vec!["child"]);

        b.delete("dir/child").await.unwrap();
        assert!(fake.nodes.lock().get("/alice/stor/vault/dir/child").is_none());
        b.delete("dir").await.unwrap();
        // Pruning stops at the root directory.
        let nodes = fake.nodes.lock();
        assert!(nodes.get("/alice/stor/vault/dir").is_none());
        assert!(matches!(nodes.get("/alice/stor/vault"), Some(Node::Dir)));
    }

    #[tokio::test]
    async fn test_list_pages_through_large_directories() {
        let (b, fake) = start("vault").await;
        {
            let mut nodes = fake.nodes.lock();
            nodes.insert("/alice/stor/vault".into(), Node::Dir);
            for i in 0..(LIST_LIMIT + 5) {
                let dir = format!("/alice/stor/vault/k{i:05}");
                nodes.insert(format!("{dir}/{VALUE_MARKER}"), Node::Object(vec![]));
                nodes.insert(dir, Node::Dir);
            }
        }
        let names = b.list("").await.unwrap();
        assert_eq!(names.len(), LIST_LIMIT + 5);
        assert_eq!(names.first().map(String::as_str), Some("k00000"));
    }

    #[tokio::test]
    async fn test_unsigned_requests_rejected() {
        let (b, fake) = start("vault").await;
        let other = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = other.to_pkcs8_pem(LineEnding::LF).unwrap();
        let forged = MantaBackend::with_signer(
            b.base.clone(),
            "alice",
            "vault",
            MantaSigner::new("alice", None, "a1:b2:c3", &pem).unwrap(),
            0,
        )
        .unwrap();
        let err = forged.put(Entry::new("k", b"v".to_vec())).await.unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
        assert_eq!(fake.nodes.lock().len(), 2);
    }

    #[test]
    fn test_signer_key_ids() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let signer = MantaSigner::new("alice", None, "aa:bb", &pem).unwrap();
        assert_eq!(signer.key_id(), "/alice/keys/aa:bb");
        let signer = MantaSigner::new("alice", Some("ops"), "aa:bb", &pem).unwrap();
        assert_eq!(signer.key_id(), "/alice/users/ops/keys/aa:bb");

        let header = signer.authorization("Thu, 01 Jan 2026 00:00:00 GMT");
        assert!(header.starts_with(
            "Signature keyId=\"/alice/users/ops/keys/aa:bb\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\""
        ));
        assert!(MantaSigner::new("alice", None, "aa:bb", "not a key").is_err());
    }

    #[tokio::test]
    async fn test_config_requires_key() {
        let err = MantaBackend::new(&BackendConfig::from([("user", "alice"), ("key_id", "aa")]))
            .await;
        if std::env::var("MANTA_KEY_MATERIAL").is_err() {
            assert!(matches!(err, Err(PhysicalError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_key_material_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let b = MantaBackend::new(&BackendConfig::from([
            ("user", "alice"),
            ("key_id", "aa:bb"),
            ("key_material", path.to_str().unwrap()),
            ("url", "http://127.0.0.1:1"),
            ("directory", "secrets"),
        ]))
        .await
        .unwrap();
        assert_eq!(b.root(), "/alice/stor/secrets");
    }
}
