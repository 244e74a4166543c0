//! # meshnet
//!
//! Peer-to-peer mesh transport for a distributed node fleet: a stable
//! cryptographic identity per node, decentralised peer discovery
//! without a central directory, and conventional gRPC services running
//! over multiplexed QUIC streams.
//!
//! The crate is split into a handful of modules that layer cleanly:
//!
//! - [`host`]: the transport host owning the [`iroh`] endpoint, the
//!   accept loop, and all streams; also the node identity.
//! - [`routing`]: the Kademlia-style routing table mapping peer
//!   identifiers to address records.
//! - [`protocol`]: the JSON wire messages and framing of the
//!   discovery protocol.
//! - [`discovery`]: the `FindNode`/`Ping` RPCs and iterative lookup
//!   that populate the routing table.
//! - [`bootstrap`]: joining the mesh through a seed set and the
//!   background refresh loop.
//! - [`bridge`]: the single-use listener that lets a
//!   connection-oriented RPC framework serve one multiplexed stream
//!   as if it were a freshly accepted socket.
//! - [`rpc`]: the dispatcher running one tonic server per inbound
//!   stream, plus the client-side [`dial`].
//!
//! ## Getting started
//!
//! ```no_run
//! use meshnet::{
//!     bootstrap, BootstrapConfig, Discovery, HostConfig, MeshHost,
//!     MeshPeerNetwork, RpcServer, RPC_ALPN,
//! };
//! use tonic::service::Routes;
//!
//! # async fn run(seeds: Vec<meshnet::PeerInfo>) -> anyhow::Result<()> {
//! let host = MeshHost::bind(HostConfig::default()).await?;
//! let discovery = Discovery::new(
//!     host.peer_info(),
//!     host.routing(),
//!     MeshPeerNetwork::new(host.clone()),
//! );
//! discovery.register(&host).await;
//!
//! let config = BootstrapConfig { seeds, ..Default::default() };
//! bootstrap(&discovery, &config, host.cancellation()).await?;
//!
//! let rpc = RpcServer::new(Routes::default());
//! rpc.serve(&host, RPC_ALPN).await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod protocol;
pub mod routing;
pub mod rpc;

/// Protocol identifier for gRPC dispatch streams. The version string
/// is the compatibility boundary: bumping it lets old and new
/// services coexist as distinct protocols.
pub const RPC_ALPN: &[u8] = b"/meshnet/rpc/1.0.0";

/// Protocol identifier for discovery streams.
pub const DHT_ALPN: &[u8] = b"/meshnet/dht/1.0.0";

pub use bootstrap::{bootstrap, BootstrapReport};
pub use bridge::{PeerIdentity, SingleUseListener};
pub use config::{default_seed_set, seed_info, BootstrapConfig, HostConfig};
pub use discovery::{Discovery, MeshPeerNetwork, PeerNetwork};
pub use error::{MeshError, Result};
pub use host::{MeshHost, MeshStream, NodeIdentity, StreamHandler};
pub use routing::{dht_id, DhtId, PeerInfo, RoutingTable, SharedRoutingTable};
pub use rpc::{dial, RpcServer};
