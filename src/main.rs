//! Mesh node binary.
//!
//! Binds the transport host, joins the mesh through the configured
//! seeds, and serves the gRPC dispatcher until interrupted.
//!
//! Configuration comes from the environment:
//!
//! - `MESHNET_PORT`: UDP port to bind (default 7946, 0 for ephemeral).
//! - `MESHNET_SEEDS`: JSON array of seed peer records, each
//!   `{"id": ..., "addr": ...}` as printed by a running node at
//!   startup. Empty falls back to the built-in seed set.

use anyhow::{Context, Result};
use tonic::service::Routes;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meshnet::{
    bootstrap, BootstrapConfig, Discovery, HostConfig, MeshHost, MeshPeerNetwork, PeerInfo,
    RpcServer, RPC_ALPN,
};

fn env_port() -> Result<u16> {
    match std::env::var("MESHNET_PORT") {
        Ok(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("invalid MESHNET_PORT {raw:?}")),
        Err(_) => Ok(meshnet::config::DEFAULT_PORT),
    }
}

fn env_seeds() -> Result<Vec<PeerInfo>> {
    match std::env::var("MESHNET_SEEDS") {
        Ok(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).context("invalid MESHNET_SEEDS")
        }
        _ => Ok(Vec::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = env_port()?;
    let seeds = env_seeds()?;
    info!(port, seeds = seeds.len(), "starting mesh node");

    let host = MeshHost::bind(HostConfig {
        port,
        ..Default::default()
    })
    .await?;

    let discovery = Discovery::new(
        host.peer_info(),
        host.routing(),
        MeshPeerNetwork::new(host.clone()),
    );
    discovery.register(&host).await;

    let config = BootstrapConfig {
        seeds,
        ..Default::default()
    };
    if let Err(err) = bootstrap(&discovery, &config, host.cancellation()).await {
        error!("mesh bootstrap failed: {err}");
        host.close().await?;
        return Err(err.into());
    }

    // Application services register their tonic routes here; a bare
    // node serves the health protocol alone.
    let rpc = RpcServer::new(Routes::default());
    rpc.serve(&host, RPC_ALPN).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down mesh node");
    rpc.graceful_stop().await;
    host.close().await?;
    info!("mesh node shut down");
    Ok(())
}
