//! # Responder Binary
//!
//! Usage: `nsock-server [addr] [echo|kv]` (defaults: `127.0.0.1:6379 kv`).
//! Verbosity follows `RUST_LOG`.

use std::env;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use nsock_server::{ResponderMode, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let mut config = ServerConfig::default();
    if let Some(addr) = args.next() {
        config.addr = addr;
    }
    if let Some(mode) = args.next() {
        config.mode = mode.parse::<ResponderMode>().map_err(|err| anyhow!(err))?;
    }

    let server = Server::bind(config.clone())
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    server.run().await.context("accept loop failed")
}
