//! DHT-based peer discovery.
//!
//! [`Discovery`] combines the routing table with a [`PeerNetwork`]
//! transport for the two discovery RPCs, `FindNode` and `Ping`. The
//! type is generic over the network layer so tests use an in-memory
//! mock while production uses [`MeshPeerNetwork`], which speaks the
//! wire protocol from [`crate::protocol`] over host streams on
//! [`crate::DHT_ALPN`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use iroh::EndpointId;
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::host::{MeshHost, MeshStream, StreamHandler};
use crate::protocol::{read_message, write_message, Envelope, Message};
use crate::routing::{distance_cmp, xor_distance, DhtId, PeerInfo, SharedRoutingTable};
use crate::DHT_ALPN;

/// Parallelism of the iterative lookup: how many peers are queried
/// concurrently per round.
const ALPHA: usize = 3;

/// Network abstraction for the discovery RPCs.
#[async_trait::async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Ask `to` for the peers closest to `target` in its table.
    async fn find_node(&self, to: &PeerInfo, target: DhtId) -> Result<Vec<PeerInfo>>;

    /// Probe `to` for liveness. Used by seed dialing and by the
    /// routing table's ping-before-evict rule.
    async fn ping(&self, to: &PeerInfo) -> Result<()>;
}

// ============================================================================
// Production network over host streams
// ============================================================================

/// [`PeerNetwork`] implementation that opens one host stream per RPC.
#[derive(Clone)]
pub struct MeshPeerNetwork {
    host: MeshHost,
}

impl MeshPeerNetwork {
    pub fn new(host: MeshHost) -> Self {
        Self { host }
    }

    async fn exchange(&self, to: &PeerInfo, body: Message) -> Result<Message> {
        let mut stream = self.host.open_stream(to.id, DHT_ALPN).await?;
        let request = Envelope {
            from: self.host.peer_info(),
            body,
        };
        write_message(&mut stream, &request).await?;
        stream.finish()?;
        let reply = read_message(&mut stream)
            .await?
            .ok_or(MeshError::StreamClosed)?;
        Ok(reply.body)
    }
}

#[async_trait::async_trait]
impl PeerNetwork for MeshPeerNetwork {
    async fn find_node(&self, to: &PeerInfo, target: DhtId) -> Result<Vec<PeerInfo>> {
        match self.exchange(to, Message::FindNode { target }).await? {
            Message::Nodes { nodes } => Ok(nodes),
            other => Err(MeshError::Protocol(format!(
                "expected Nodes, got {other:?}"
            ))),
        }
    }

    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        match self.exchange(to, Message::Ping).await? {
            Message::Pong => Ok(()),
            other => Err(MeshError::Protocol(format!(
                "expected Pong, got {other:?}"
            ))),
        }
    }
}

// ============================================================================
// Discovery node
// ============================================================================

/// The discovery side of a mesh node: owns lookups and routing table
/// maintenance, never payload transfer.
pub struct Discovery<N: PeerNetwork> {
    local: PeerInfo,
    routing: SharedRoutingTable,
    network: Arc<N>,
}

impl<N: PeerNetwork> Clone for Discovery<N> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            routing: self.routing.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: PeerNetwork> Discovery<N> {
    /// Create a discovery node over the given table and network.
    pub fn new(local: PeerInfo, routing: SharedRoutingTable, network: N) -> Self {
        Self {
            local,
            routing,
            network: Arc::new(network),
        }
    }

    /// This node's identifier.
    pub fn local_id(&self) -> EndpointId {
        self.local.id
    }

    /// This node's position in the DHT keyspace.
    pub fn local_dht_id(&self) -> DhtId {
        self.local.dht_id()
    }

    /// The underlying RPC transport.
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Fold a peer record into the routing table.
    ///
    /// Records for the local node are dropped. When the target bucket
    /// is full, the oldest entry is pinged on a background task and
    /// only evicted if it no longer answers.
    pub async fn observe_peer(&self, info: PeerInfo) {
        if info.id == self.local.id {
            return;
        }
        let pending = {
            let mut routing = self.routing.write().await;
            routing.update_with_pending(info)
        };
        if let Some(pending) = pending {
            let network = self.network.clone();
            let routing = self.routing.clone();
            tokio::spawn(async move {
                let alive = match network.ping(&pending.oldest).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(peer = %pending.oldest.id, "eviction probe failed: {err}");
                        false
                    }
                };
                routing.write().await.apply_ping_result(pending, alive);
            });
        }
    }

    /// Whether a record for the peer is present in the table.
    pub async fn contains(&self, id: &EndpointId) -> bool {
        self.routing.read().await.contains(id)
    }

    /// Drop the record for a peer.
    pub async fn forget(&self, id: &EndpointId) {
        self.routing.write().await.remove(id);
    }

    /// Number of records currently in the routing table.
    pub async fn table_size(&self) -> usize {
        self.routing.read().await.len()
    }

    /// Iterative Kademlia lookup for the peers closest to `target`.
    ///
    /// Queries up to [`ALPHA`] candidates per round, merges their
    /// answers into the shortlist, and stops once a round brings
    /// nothing closer. Individual query failures only log.
    pub async fn find_closest(&self, target: DhtId) -> Result<Vec<PeerInfo>> {
        let k = {
            let routing = self.routing.read().await;
            routing.k()
        };

        let mut shortlist = {
            let routing = self.routing.read().await;
            routing.closest(&target, k)
        };
        let mut seen: HashSet<EndpointId> = shortlist.iter().map(|p| p.id).collect();
        let mut queried: HashSet<EndpointId> = HashSet::new();

        sort_by_distance(&mut shortlist, &target);
        let mut best = shortlist
            .first()
            .map(|p| xor_distance(&p.dht_id(), &target))
            .unwrap_or([0xff; 32]);

        loop {
            let candidates: Vec<PeerInfo> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let responses = join_all(
                candidates
                    .iter()
                    .map(|c| self.network.find_node(c, target)),
            )
            .await;

            for (peer, response) in candidates.iter().zip(responses) {
                let nodes = match response {
                    Ok(nodes) => {
                        self.observe_peer(peer.clone()).await;
                        nodes
                    }
                    Err(err) => {
                        debug!(peer = %peer.id, "discovery query failed: {err}");
                        continue;
                    }
                };
                for node in nodes {
                    if node.id == self.local.id {
                        continue;
                    }
                    self.observe_peer(node.clone()).await;
                    if seen.insert(node.id) {
                        shortlist.push(node);
                    }
                }
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let mut progressed = false;
            if let Some(first) = shortlist.first() {
                let candidate = xor_distance(&first.dht_id(), &target);
                if distance_cmp(&candidate, &best) == std::cmp::Ordering::Less {
                    best = candidate;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        Ok(shortlist)
    }

    /// Serve an inbound `FindNode`: remember the caller, answer with
    /// the closest known peers.
    pub async fn handle_find_node(&self, from: PeerInfo, target: DhtId) -> Vec<PeerInfo> {
        self.observe_peer(from).await;
        let routing = self.routing.read().await;
        let k = routing.k();
        routing.closest(&target, k)
    }

    /// Serve an inbound `Ping`: remember the caller.
    pub async fn handle_ping(&self, from: PeerInfo) {
        self.observe_peer(from).await;
    }
}

impl<N: PeerNetwork> Discovery<N> {
    /// Attach the discovery protocol handler to the host, answering
    /// `FindNode` and `Ping` on [`DHT_ALPN`].
    pub async fn register(&self, host: &MeshHost) {
        host.set_stream_handler(DHT_ALPN, Arc::new(DiscoveryStreamHandler {
            discovery: self.clone(),
        }))
        .await;
    }
}

fn sort_by_distance(peers: &mut [PeerInfo], target: &DhtId) {
    peers.sort_by(|a, b| {
        let da = xor_distance(&a.dht_id(), target);
        let db = xor_distance(&b.dht_id(), target);
        distance_cmp(&da, &db)
    });
}

// ============================================================================
// Inbound stream handler
// ============================================================================

/// One request/reply exchange per inbound discovery stream.
struct DiscoveryStreamHandler<N: PeerNetwork> {
    discovery: Discovery<N>,
}

#[async_trait::async_trait]
impl<N: PeerNetwork> StreamHandler for DiscoveryStreamHandler<N> {
    async fn handle(&self, mut stream: MeshStream) -> anyhow::Result<()> {
        let Some(request) = read_message(&mut stream).await? else {
            return Ok(());
        };
        if request.from.id != stream.remote() {
            warn!(
                peer = %stream.remote(),
                claimed = %request.from.id,
                "discovery request claims a different sender, dropping"
            );
            return Ok(());
        }

        let body = match request.body {
            Message::Ping => {
                self.discovery.handle_ping(request.from).await;
                Message::Pong
            }
            Message::FindNode { target } => Message::Nodes {
                nodes: self.discovery.handle_find_node(request.from, target).await,
            },
            // Reply kinds never arrive unsolicited from a well-behaved
            // peer; answer with a plain Pong so it learns we are alive
            // without leaking routing information.
            Message::Pong | Message::Nodes { .. } => Message::Pong,
        };

        let reply = Envelope {
            from: self.discovery.local.clone(),
            body,
        };
        write_message(&mut stream, &reply).await?;
        stream.finish()?;
        Ok(())
    }
}
