use crate::vault::StoreError;

/// Errors surfaced by the agent and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("secret store unavailable: {0}")]
    BackendUnavailable(#[from] StoreError),

    #[error("malformed key record `{name}`: {reason}")]
    MalformedKeyRecord { name: String, reason: String },

    #[error("no private key match requested public key")]
    NoMatchingKey,

    #[error("operation unsupported")]
    OperationUnsupported,

    #[error("signing failed: {0}")]
    Signing(#[from] signature::Error),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] ssh_encoding::Error),

    #[error("key error: {0}")]
    Key(#[from] ssh_key::Error),

    #[error("connection error: {0}")]
    Connection(#[from] ssh_agent_lib::error::AgentError),
}

impl Error {
    pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::MalformedKeyRecord {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
