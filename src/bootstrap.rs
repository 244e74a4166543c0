//! Bootstrap coordinator: joins the mesh through a seed set and keeps
//! the routing table populated afterwards.

use futures::future::join_all;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{default_seed_set, BootstrapConfig};
use crate::discovery::{Discovery, PeerNetwork};
use crate::error::{MeshError, Result};
use crate::routing::PeerInfo;

/// Outcome of one bootstrap invocation.
#[derive(Clone, Copy, Debug)]
pub struct BootstrapReport {
    /// Seeds that were dialed.
    pub attempted: usize,
    /// Seeds that answered.
    pub connected: usize,
}

/// Join the mesh through the configured seed peers.
///
/// Every seed is dialed concurrently; a seed that is already known is
/// still re-dialed. Individual failures are logged as warnings, but if
/// no seed at all answers the node has not joined the mesh and this
/// returns [`MeshError::BootstrapUnreachable`], leaving the routing
/// table as it was before the call. Each reachable seed is then asked
/// for the peers closest to the local node and the answers are merged
/// into the routing table. On success a background refresh loop is
/// started; it runs until `cancel` fires.
pub async fn bootstrap<N: PeerNetwork>(
    discovery: &Discovery<N>,
    config: &BootstrapConfig,
    cancel: CancellationToken,
) -> Result<BootstrapReport> {
    let mut seeds: Vec<PeerInfo> = if config.seeds.is_empty() {
        info!("no seed peers configured, falling back to the built-in seed set");
        default_seed_set()
    } else {
        config.seeds.clone()
    };
    seeds.retain(|seed| seed.id != discovery.local_id());

    if seeds.is_empty() {
        return Err(MeshError::BootstrapUnreachable { attempted: 0 });
    }

    // Seed addresses must be resolvable before the dial; remember
    // which ones were unknown so failures can be rolled back and the
    // table is untouched when nothing was reachable.
    let mut provisional = Vec::new();
    for seed in &seeds {
        if !discovery.contains(&seed.id).await {
            provisional.push(seed.id);
        }
        discovery.observe_peer(seed.clone()).await;
    }

    info!(seeds = seeds.len(), "bootstrapping mesh");
    let dials = seeds.iter().map(|seed| async move {
        match timeout(config.dial_timeout, discovery.network().ping(seed)).await {
            Ok(Ok(())) => {
                info!(peer = %seed.id, "connected to seed peer");
                true
            }
            Ok(Err(err)) => {
                warn!(peer = %seed.id, "failed to connect to seed peer: {err}");
                false
            }
            Err(_) => {
                warn!(peer = %seed.id, "seed peer dial timed out");
                false
            }
        }
    });
    let outcomes = join_all(dials).await;

    for (seed, connected) in seeds.iter().zip(&outcomes) {
        if !*connected && provisional.contains(&seed.id) {
            discovery.forget(&seed.id).await;
        }
    }

    let report = BootstrapReport {
        attempted: seeds.len(),
        connected: outcomes.iter().filter(|ok| **ok).count(),
    };
    if report.connected == 0 {
        return Err(MeshError::BootstrapUnreachable {
            attempted: report.attempted,
        });
    }

    // Ask every reachable seed for the peers closest to us and merge
    // the answers, deduplicated by peer id.
    let self_target = discovery.local_dht_id();
    for (seed, connected) in seeds.iter().zip(&outcomes) {
        if !*connected {
            continue;
        }
        match discovery.network().find_node(seed, self_target).await {
            Ok(nodes) => {
                for node in nodes {
                    discovery.observe_peer(node).await;
                }
            }
            Err(err) => {
                warn!(peer = %seed.id, "closest-peers query failed: {err}");
            }
        }
    }

    info!(
        connected = report.connected,
        attempted = report.attempted,
        peers = discovery.table_size().await,
        "mesh bootstrap complete"
    );

    spawn_refresh_loop(discovery.clone(), config, cancel);
    Ok(report)
}

/// Long-lived loop reporting routing table health until cancelled.
/// Failures never escalate past a log line; discovery degrades
/// gracefully.
fn spawn_refresh_loop<N: PeerNetwork>(
    discovery: Discovery<N>,
    config: &BootstrapConfig,
    cancel: CancellationToken,
) {
    let every = config.refresh_interval;
    tokio::spawn(async move {
        let mut ticker = interval(every);
        // The first tick fires immediately; skip it, bootstrap just logged.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let peers = discovery.table_size().await;
                    info!(peers, "routing table refresh");
                }
            }
        }
        debug!("routing table refresh loop stopped");
    });
}
