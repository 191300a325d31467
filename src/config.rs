use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::SecretString;

use crate::error::{Error, Result};

pub const DEFAULT_KEY_PATH: &str = "kv/ssh_keys";
const SOCKET_DIR: &str = "vault-agent";
const SOCKET_NAME: &str = "agent.sock";
const TOKEN_FILE: &str = ".vault-token";

/// A secret store location, split into the mount and the key prefix below it.
///
/// `kv/ssh_keys/team` has mount `kv` and prefix `ssh_keys/team`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretPath {
    mount: String,
    prefix: String,
}

impl SecretPath {
    pub fn parse(path: &str) -> Result<Self> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let mount = segments
            .next()
            .ok_or_else(|| Error::ConfigInvalid(format!("secret path {path:?} has no segments")))?;
        Ok(Self {
            mount: mount.to_string(),
            prefix: segments.collect::<Vec<_>>().join("/"),
        })
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Path of the secret `name`, relative to the mount.
    pub fn key_path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

impl FromStr for SecretPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}", self.mount)
        } else {
            write!(f, "{}/{}", self.mount, self.prefix)
        }
    }
}

/// Startup settings as given on the command line or in the environment.
/// Unset values are filled in by [`Settings::resolve`].
#[derive(Debug, Default, Clone)]
pub struct Settings {
    pub sock: Option<String>,
    pub vault_addr: Option<String>,
    pub vault_token: Option<String>,
    pub vault_namespace: Option<String>,
    pub key_path: String,
}

/// Validated configuration the agent and server are built from.
pub struct Config {
    /// `service-binding` URI of the agent socket.
    pub bind: String,
    pub vault_addr: String,
    pub vault_token: SecretString,
    pub vault_namespace: Option<String>,
    pub key_path: SecretPath,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("vault_addr", &self.vault_addr)
            .field("vault_namespace", &self.vault_namespace)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Applies defaults from the user's config and home directories, then validates.
    pub fn resolve(self) -> Result<Config> {
        self.resolve_in(dirs::config_dir().as_deref(), dirs::home_dir().as_deref())
    }

    fn resolve_in(self, config_dir: Option<&Path>, home_dir: Option<&Path>) -> Result<Config> {
        let sock = non_empty(self.sock).or_else(|| {
            config_dir.map(|dir| {
                dir.join(SOCKET_DIR)
                    .join(SOCKET_NAME)
                    .to_string_lossy()
                    .into_owned()
            })
        });
        let token = non_empty(self.vault_token).or_else(|| {
            let path = home_dir?.join(TOKEN_FILE);
            let token = std::fs::read_to_string(path).ok()?;
            non_empty(Some(token.trim().to_string()))
        });

        let sock = sock.ok_or_else(|| Error::ConfigInvalid("invalid socket path".into()))?;
        let vault_addr = non_empty(self.vault_addr)
            .ok_or_else(|| Error::ConfigInvalid("invalid vault address".into()))?;
        let vault_token = token.ok_or_else(|| Error::ConfigInvalid("invalid vault token".into()))?;

        Ok(Config {
            bind: binding_uri(&sock),
            vault_addr,
            vault_token: SecretString::new(vault_token),
            vault_namespace: non_empty(self.vault_namespace),
            key_path: SecretPath::parse(&self.key_path)?,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Plain paths are unix sockets; anything with a scheme is passed through.
fn binding_uri(sock: &str) -> String {
    if sock.contains("://") {
        sock.to_string()
    } else {
        format!("unix://{}", PathBuf::from(sock).display())
    }
}
