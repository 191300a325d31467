use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vault_agent::config::DEFAULT_KEY_PATH;
use vault_agent::{server, Settings, VaultAgent, VaultClient};

/// SSH agent backed by Vault
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// socket path or binding URI (unix://, tcp://, fd://) [default: <config dir>/vault-agent/agent.sock]
    #[clap(long = "sock", env = "VAULT_AGENT_SOCK")]
    sock: Option<String>,
    /// vault address
    #[clap(long = "vault", env = "VAULT_ADDR")]
    vault: Option<String>,
    /// vault token, read from ~/.vault-token when unset
    #[clap(long = "token", env = "VAULT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// vault enterprise namespace
    #[clap(long = "namespace", env = "VAULT_NAMESPACE")]
    namespace: Option<String>,
    /// vault secret path holding the ssh keys, mount first
    #[clap(long = "path", default_value = DEFAULT_KEY_PATH)]
    path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Settings {
        sock: args.sock,
        vault_addr: args.vault,
        vault_token: args.token,
        vault_namespace: args.namespace,
        key_path: args.path,
    }
    .resolve()?;

    let client = VaultClient::new(
        &config.vault_addr,
        config.vault_token,
        config.vault_namespace,
    )
    .context("failed to create vault client")?;
    let agent = Arc::new(VaultAgent::new(Arc::new(client), config.key_path));

    tokio::select! {
        res = server::run(agent, &config.bind) => res.context("failed to run agent"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
