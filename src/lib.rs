//! SSH agent serving keys stored in HashiCorp Vault.
//!
//! Private keys live in a KV v2 secret engine, one secret per key:
//!
//! ```text
//! kv/ssh_keys/deploy    { "private": "<PEM>" }
//! kv/ssh_keys/readonly  { "private": "<PEM>", "sign": "false" }
//! ```
//!
//! Every identity listing and sign request re-reads the store, so rotated or
//! revoked keys take effect immediately. Keys flagged `sign = "false"` are
//! listed but never used for signing. Adding, removing and locking keys
//! through the agent protocol is refused.
//!
//! ```text
//! server::run ── per connection ──► VaultAgent::serve ──► Session::handle
//!                                                              │
//!                                           KeyResolver ◄──────┘
//!                                                │
//!                                           SecretStore (VaultClient)
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod key;
pub mod server;
pub mod vault;

pub use agent::VaultAgent;
pub use config::{Config, SecretPath, Settings};
pub use error::{Error, Result};
pub use key::{KeyResolver, ResolvedSigner};
pub use vault::{SecretStore, StoreError, ValueMap, VaultClient};
