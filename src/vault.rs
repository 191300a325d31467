//! Secret store access.
//!
//! [`SecretStore`] is what the agent needs from a backend: list the children
//! of a prefix and read the value map of one secret. [`VaultClient`] provides
//! it over HashiCorp Vault's KV version 2 HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

/// Field map of one secret version.
pub type ValueMap = serde_json::Map<String, serde_json::Value>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path}: vault responded {status}: {message}")]
    Status {
        path: String,
        status: StatusCode,
        message: String,
    },

    #[error("{path}: secret not found")]
    NotFound { path: String },

    #[error("failed to build vault client: {0}")]
    Client(#[source] reqwest::Error),
}

/// A path-addressed, versioned key/value secret store.
///
/// Implementations must be safe to call concurrently; every connection the
/// agent serves issues its own requests.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Names directly below `prefix` in `mount`. Names ending in `/` are folders.
    async fn list(&self, mount: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Value map of the latest version of the secret at `path` in `mount`.
    async fn get(&self, mount: &str, path: &str) -> Result<ValueMap, StoreError>;
}

/// Vault KV v2 client authenticated with a token.
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: SecretString,
    namespace: Option<String>,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("addr", &self.addr)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ListData {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct KvData {
    data: Option<ValueMap>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultClient {
    pub fn new(
        addr: &str,
        token: SecretString,
        namespace: Option<String>,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("vault-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StoreError::Client)?;
        Ok(Self {
            http,
            addr: addr.trim_end_matches('/').to_string(),
            token,
            namespace,
        })
    }

    fn url(&self, mount: &str, kind: &str, path: &str) -> String {
        format!("{}/v1/{}", self.addr, api_path(mount, kind, path))
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let request = self
            .http
            .get(url)
            .header("X-Vault-Token", self.token.expose_secret())
            .header("X-Vault-Request", "true");
        match &self.namespace {
            Some(ns) => request.header("X-Vault-Namespace", ns),
            None => request,
        }
    }

    /// Sends `request`, returning `None` on 404.
    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        request: RequestBuilder,
    ) -> Result<Option<T>, StoreError> {
        let wrap = |source| StoreError::Request {
            path: path.to_string(),
            source,
        };
        let resp = request.send().await.map_err(wrap)?;
        let status = resp.status();
        debug!(%path, %status, "vault response");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body: ErrorBody = resp.json().await.unwrap_or_default();
            return Err(StoreError::Status {
                path: path.to_string(),
                status,
                message: body
                    .errors
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "no error message".to_string()),
            });
        }
        resp.json().await.map(Some).map_err(wrap)
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn list(&self, mount: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let path = api_path(mount, "metadata", prefix);
        let request = self
            .request(&self.url(mount, "metadata", prefix))
            .query(&[("list", "true")]);
        let listing: Option<Envelope<ListData>> = self.send(&path, request).await?;
        Ok(listing.map(|l| l.data.keys).unwrap_or_default())
    }

    async fn get(&self, mount: &str, path: &str) -> Result<ValueMap, StoreError> {
        let api = api_path(mount, "data", path);
        let request = self.request(&self.url(mount, "data", path));
        let secret: Option<Envelope<KvData>> = self.send(&api, request).await?;
        secret
            .and_then(|s| s.data.data)
            .ok_or(StoreError::NotFound { path: api })
    }
}

/// `{mount}/{kind}/{path}` with empty components dropped.
fn api_path(mount: &str, kind: &str, path: &str) -> String {
    [mount, kind, path.trim_matches('/')]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> VaultClient {
        VaultClient::new(
            "https://vault.example.com:8200/",
            SecretString::new("s.token".into()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn builds_kv2_urls() {
        let c = client();
        assert_eq!(
            c.url("kv", "metadata", "ssh_keys"),
            "https://vault.example.com:8200/v1/kv/metadata/ssh_keys"
        );
        assert_eq!(
            c.url("kv", "data", "ssh_keys/deploy"),
            "https://vault.example.com:8200/v1/kv/data/ssh_keys/deploy"
        );
        assert_eq!(
            c.url("secret", "metadata", ""),
            "https://vault.example.com:8200/v1/secret/metadata"
        );
    }

    #[test]
    fn debug_hides_token() {
        assert!(!format!("{:?}", client()).contains("s.token"));
    }

    #[test]
    fn decodes_list_response() {
        let body = r#"{"request_id":"x","data":{"keys":["deploy","readonly","team/"]}}"#;
        let parsed: Envelope<ListData> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.keys, vec!["deploy", "readonly", "team/"]);
    }

    #[test]
    fn decodes_kv2_secret() {
        let body = r#"{
            "data": {
                "data": {"private": "pem", "sign": "false"},
                "metadata": {"version": 3, "deletion_time": ""}
            }
        }"#;
        let parsed: Envelope<KvData> = serde_json::from_str(body).unwrap();
        let data = parsed.data.data.unwrap();
        assert_eq!(data["private"], "pem");
        assert_eq!(data["sign"], "false");
    }

    #[test]
    fn deleted_version_has_no_data() {
        let body = r#"{"data": {"data": null, "metadata": {"version": 2}}}"#;
        let parsed: Envelope<KvData> = serde_json::from_str(body).unwrap();
        assert!(parsed.data.data.is_none());
    }

    #[test]
    fn decodes_error_body() {
        let body: ErrorBody = serde_json::from_str(r#"{"errors":["permission denied"]}"#).unwrap();
        assert_eq!(body.errors, vec!["permission denied"]);
    }
}
