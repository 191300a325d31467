//! SSH agent protocol over keys held in the secret store.

use std::sync::Arc;

use futures::future::join_all;
use futures::{SinkExt as _, TryStreamExt as _};
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::codec::Codec;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{AddIdentity, Identity, RemoveIdentity, Request, Response, SignRequest};
use ssh_key::public::KeyData;
use ssh_key::{PrivateKey, Signature};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

use crate::config::SecretPath;
use crate::error::{Error, Result};
use crate::key::{wire_encode, KeyResolver, ResolvedSigner};
use crate::vault::SecretStore;

/// Upper bound on a single agent message, matching OpenSSH's agent.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

const HEADER_LEN: usize = 4;

/// Agent backed by the secret store.
///
/// Holds no key material and no mutable state. `ssh-agent-lib` clones it
/// for every connection.
#[derive(Clone)]
pub struct VaultAgent {
    resolver: KeyResolver,
}

impl std::fmt::Debug for VaultAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultAgent")
            .field("path", self.resolver.path())
            .finish_non_exhaustive()
    }
}

impl VaultAgent {
    pub fn new(store: Arc<dyn SecretStore>, path: SecretPath) -> Self {
        Self {
            resolver: KeyResolver::new(store, path),
        }
    }

    /// Resolves every record below the prefix, dropping (and logging) records
    /// that fail. Only a failed listing fails the call.
    async fn resolve_all(&self) -> Result<Vec<ResolvedSigner>> {
        let names = self.resolver.names().await?;
        let resolved = join_all(names.iter().map(|name| self.resolver.resolve(name))).await;
        Ok(names
            .iter()
            .zip(resolved)
            .filter_map(|(name, result)| match result {
                Ok(signer) => Some(signer),
                Err(e) => {
                    warn!(%name, "unable to get ssh key: {e}");
                    None
                }
            })
            .collect())
    }

    async fn signing_keys(&self) -> Result<Vec<ResolvedSigner>> {
        let mut signers = self.resolve_all().await?;
        signers.retain(|s| s.for_sign);
        Ok(signers)
    }

    /// Every resolvable key, signing-eligible or not.
    pub async fn list_keys(&self) -> Result<Vec<Identity>> {
        let identities: Vec<Identity> = self
            .resolve_all()
            .await?
            .iter()
            .map(ResolvedSigner::identity)
            .collect();
        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    /// Signs `data` with the eligible key whose public blob is `pubkey`.
    ///
    /// Blobs are compared in wire encoding. [`serve`](Self::serve) only
    /// accepts requests that re-encode to the bytes the client sent, so this
    /// is the client's blob byte for byte.
    pub async fn sign_data(&self, pubkey: &KeyData, data: &[u8], flags: u32) -> Result<Signature> {
        let wanted = wire_encode(pubkey)?;
        for signer in self.signing_keys().await? {
            if signer.public_blob()? != wanted {
                continue;
            }
            debug!(name = %signer.name, data_len = data.len(), flags, "sign");
            return signer.sign(data, flags);
        }
        Err(Error::NoMatchingKey)
    }

    /// Keys currently eligible for signing.
    pub async fn signers(&self) -> Result<Vec<PrivateKey>> {
        Ok(self
            .signing_keys()
            .await?
            .into_iter()
            .map(|s| s.key)
            .collect())
    }

    /// Runs the agent protocol on `stream` until the peer hangs up.
    ///
    /// End of stream between messages is a clean shutdown; a peer leaving in
    /// the middle of a message is an error. A message that cannot be decoded
    /// is answered with a failure and the connection stays open. A frame with
    /// a zero or oversized length ends the connection.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = self.clone();
        let mut frames = Framed::new(stream, AgentCodec::default());
        while let Some(incoming) = frames.try_next().await? {
            let response = match incoming {
                Incoming::Request(request) => session.handle(request).await.unwrap_or_else(|e| {
                    warn!("agent request failed: {e}");
                    Response::Failure
                }),
                Incoming::Undecodable(e) => {
                    debug!("undecodable agent request: {e}");
                    Response::Failure
                }
            };
            frames.send(response).await?;
        }
        Ok(())
    }
}

fn unsupported() -> Result<(), AgentError> {
    Err(AgentError::other(Error::OperationUnsupported))
}

#[ssh_agent_lib::async_trait]
impl Session for VaultAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        self.list_keys().await.map_err(AgentError::other)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        self.sign_data(&request.pubkey, &request.data, request.flags)
            .await
            .map_err(AgentError::other)
    }

    async fn add_identity(&mut self, _identity: AddIdentity) -> Result<(), AgentError> {
        unsupported()
    }

    async fn remove_identity(&mut self, _identity: RemoveIdentity) -> Result<(), AgentError> {
        unsupported()
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        unsupported()
    }

    async fn lock(&mut self, _key: String) -> Result<(), AgentError> {
        unsupported()
    }

    async fn unlock(&mut self, _key: String) -> Result<(), AgentError> {
        unsupported()
    }
}

enum Incoming {
    Request(Request),
    Undecodable(AgentError),
}

/// `ssh-agent-lib`'s codec with a bound on message length. Each frame is
/// handed to the library codec on its own, so a body that fails to decode
/// is consumed and reported instead of poisoning the stream.
#[derive(Debug, Default)]
struct AgentCodec(Codec<Request, Response>);

impl Decoder for AgentCodec {
    type Item = Incoming;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>, AgentError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 || len > MAX_MESSAGE_LEN {
            return Err(AgentError::other(Error::Protocol(format!(
                "invalid message length {len}"
            ))));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_LEN + len);
        let body = frame[HEADER_LEN..].to_vec();
        let incoming = match self.0.decode(&mut frame) {
            Ok(Some(request)) if wire_encode(&request).ok().as_deref() == Some(body.as_slice()) => {
                Incoming::Request(request)
            }
            Ok(_) => Incoming::Undecodable(AgentError::other(Error::Protocol(
                "request is not canonically encoded".into(),
            ))),
            Err(e) => Incoming::Undecodable(e),
        };
        Ok(Some(incoming))
    }
}

impl Encoder<Response> for AgentCodec {
    type Error = AgentError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), AgentError> {
        self.0.encode(item, dst)
    }
}
