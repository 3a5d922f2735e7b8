//! Lite Minecraft reverse proxy.
//! It inspects the initial Minecraft handshake to extract the 'server address'
//! (the string the client typed into multiplayer), matches it against an
//! ordered route table (exact, '*' and '*.suffix' patterns) and forwards the
//! TCP stream to one of the route's backends, optionally prepending a PROXY
//! protocol v2 header or rewriting the handshake with the client's real IP.
//!
//! Only the modern (VarInt-based) handshake is inspected; afterwards the
//! connection is a plain TCP hop in both directions. No encryption or
//! compression handling is performed.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};

mod config;
mod forward;
mod haproxy;
mod protocol;
mod routing;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = Config::load(None)?;
    if !cfg.lite_enabled {
        bail!("lite.enabled is false; this binary only serves lite routing");
    }
    if cfg.routes.is_empty() {
        tracing::warn!("no routes configured; every connection will be dropped");
    }
    let listen_addr = cfg.listen.clone();
    let cfg = Arc::new(RwLock::new(cfg));

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(%listen_addr, "listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        // Config changes apply to connections accepted after the change.
        let snapshot = cfg.read().await.snapshot();
        tokio::spawn(async move {
            debug!(client = %peer, "accepted");
            forward::handle_connection(socket, peer, snapshot).await;
        });
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mc_lite=debug".into()),
        )
        .try_init();
}
