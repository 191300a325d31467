//! Socket listener feeding connections to the agent.

use std::io;
use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use service_binding::{Binding, Listener};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use crate::agent::VaultAgent;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Source of accepted connections.
#[async_trait]
trait Acceptor: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept_stream(&self) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Acceptor for UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept_stream(&self) -> io::Result<Self::Stream> {
        self.accept().await.map(|(stream, _)| stream)
    }
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept_stream(&self) -> io::Result<Self::Stream> {
        self.accept().await.map(|(stream, _)| stream)
    }
}

/// Removes the socket file when the server stops.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), "failed to remove agent socket: {e}");
        }
    }
}

/// Binds `bind` (a `service-binding` URI) and serves the agent on every
/// accepted connection until a permanent accept error occurs.
pub async fn run(agent: Arc<VaultAgent>, bind: &str) -> anyhow::Result<()> {
    let binding: Binding = bind
        .parse()
        .map_err(|e| anyhow!("invalid socket binding {bind:?}: {e:?}"))?;

    let socket_file = match &binding {
        Binding::FilePath(path) => {
            prepare_socket_path(path)?;
            Some(SocketFile(path.clone()))
        }
        _ => None,
    };

    let listener: Listener = binding
        .try_into()
        .with_context(|| format!("failed to listen on {bind}"))?;

    if let Some(SocketFile(path)) = &socket_file {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {}", path.display()))?;
    }

    info!("Listening on socket {bind}");
    match listener {
        Listener::Unix(listener) => accept_loop(agent, UnixListener::from_std(listener)?).await,
        Listener::Tcp(listener) => accept_loop(agent, TcpListener::from_std(listener)?).await,
    }
}

/// Clears a stale socket left by a previous run and creates its directory.
fn prepare_socket_path(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale agent socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove {}", path.display()));
        }
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

async fn accept_loop<A: Acceptor>(agent: Arc<VaultAgent>, listener: A) -> anyhow::Result<()> {
    loop {
        let stream = match listener.accept_stream().await {
            Ok(stream) => stream,
            Err(e) if is_temporary(&e) => {
                warn!("Temporary accept error: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
            Err(e) => return Err(e).context("failed to accept connection"),
        };
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            debug!("connection accepted");
            if let Err(e) = agent.serve(stream).await {
                warn!("Agent handle connection failed: {e}");
            }
        });
    }
}

/// Accept errors worth retrying: interrupted calls, connections torn down
/// before being accepted, and descriptor exhaustion.
fn is_temporary(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}
