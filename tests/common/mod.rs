#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand_core::OsRng;
use reqwest::StatusCode;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vault_agent::key::wire_encode;
use vault_agent::{SecretPath, SecretStore, StoreError, ValueMap, VaultAgent};

pub const MOUNT: &str = "kv";
pub const PREFIX: &str = "keys";

pub const RSA_PKCS1: &str = include_str!("../fixtures/rsa_pkcs1.pem");
pub const P256_SEC1: &str = include_str!("../fixtures/ecdsa_p256_sec1.pem");
pub const P384_PKCS8: &str = include_str!("../fixtures/ecdsa_p384_pkcs8.pem");

/// In-memory secret store keyed by `mount/path`.
#[derive(Default)]
pub struct MemoryStore {
    secrets: Mutex<BTreeMap<String, ValueMap>>,
    list_down: AtomicBool,
    unreadable: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, name: &str, record: serde_json::Value) {
        let record = record.as_object().expect("record must be an object").clone();
        self.secrets
            .lock()
            .unwrap()
            .insert(format!("{MOUNT}/{PREFIX}/{name}"), record);
    }

    pub fn set_list_down(&self, down: bool) {
        self.list_down.store(down, Ordering::SeqCst);
    }

    /// Makes reads of `name` fail while it stays listed.
    pub fn fail_get(&self, name: &str) {
        self.unreadable
            .lock()
            .unwrap()
            .insert(format!("{MOUNT}/{PREFIX}/{name}"));
    }

    pub fn snapshot(&self) -> BTreeMap<String, ValueMap> {
        self.secrets.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn list(&self, mount: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = format!("{mount}/{prefix}/");
        if self.list_down.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                path: base,
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "Vault is sealed".into(),
            });
        }
        let mut names: Vec<String> = Vec::new();
        for key in self.secrets.lock().unwrap().keys() {
            let Some(rest) = key.strip_prefix(&base) else {
                continue;
            };
            let name = match rest.split_once('/') {
                Some((folder, _)) => format!("{folder}/"),
                None => rest.to_string(),
            };
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn get(&self, mount: &str, path: &str) -> Result<ValueMap, StoreError> {
        let key = format!("{mount}/{path}");
        if self.unreadable.lock().unwrap().contains(&key) {
            return Err(StoreError::Status {
                path: key,
                status: StatusCode::FORBIDDEN,
                message: "permission denied".into(),
            });
        }
        self.secrets
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound { path: key })
    }
}

pub fn agent(store: &Arc<MemoryStore>) -> Arc<VaultAgent> {
    let path = SecretPath::parse(&format!("{MOUNT}/{PREFIX}")).unwrap();
    Arc::new(VaultAgent::new(store.clone(), path))
}

pub fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

pub fn openssh(key: &PrivateKey) -> String {
    key.to_openssh(LineEnding::LF).unwrap().to_string()
}

pub fn public_blob(key: &PrivateKey) -> Vec<u8> {
    wire_encode(key.public_key().key_data()).unwrap()
}

/// Sends one framed agent message and reads the framed answer.
pub async fn roundtrip<S>(stream: &mut S, body: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u32(body.len() as u32).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
    let len = stream.read_u32().await.unwrap() as usize;
    let mut answer = vec![0; len];
    stream.read_exact(&mut answer).await.unwrap();
    answer
}
