//! Host and bootstrap configuration.
//!
//! Configuration loading and parsing live with the embedding
//! application; this module only defines the structs the transport
//! consumes, their defaults, and the built-in seed set used when no
//! seeds are configured.

use std::time::Duration;

use iroh::{EndpointAddr, EndpointId, SecretKey};
use tracing::warn;

use crate::routing::PeerInfo;
use crate::{DHT_ALPN, RPC_ALPN};

/// Default UDP port for the mesh endpoint. Zero in [`HostConfig`] asks
/// the OS for an ephemeral port instead.
pub const DEFAULT_PORT: u16 = 7946;

/// How often the background refresh loop reports routing table health.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on a single bootstrap seed dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-bucket routing table capacity.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Well-known seed identities, dialed only when no seeds are
/// configured. These records carry no socket addresses; reaching them
/// requires the relay infrastructure, so in an isolated network the
/// fallback fails fast with `BootstrapUnreachable` rather than
/// hanging.
const DEFAULT_SEED_IDS: &[&str] = &[
    "5866666666666666666666666666666666666666666666666666666666666666",
    "0100000000000000000000000000000000000000000000000000000000000000",
];

/// Configuration for binding a [`crate::host::MeshHost`].
#[derive(Debug)]
pub struct HostConfig {
    /// Identity key for the node. `None` generates a fresh keypair, so
    /// the node's identifier changes across restarts; callers that need
    /// a stable identity persist the key themselves and inject it here.
    pub secret_key: Option<SecretKey>,
    /// UDP port to bind; 0 selects an ephemeral port.
    pub port: u16,
    /// Protocol identifiers negotiable on inbound connections. Handlers
    /// are attached separately via `set_stream_handler`.
    pub protocols: Vec<Vec<u8>>,
    /// Routing table bucket capacity.
    pub bucket_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            port: 0,
            protocols: vec![RPC_ALPN.to_vec(), DHT_ALPN.to_vec()],
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

/// Configuration for [`crate::bootstrap::bootstrap`].
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Seed peers to join through. Empty falls back to
    /// [`default_seed_set`].
    pub seeds: Vec<PeerInfo>,
    /// Interval of the background routing table refresh loop.
    pub refresh_interval: Duration,
    /// Upper bound on each individual seed dial.
    pub dial_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Build a [`PeerInfo`] from an identity alone.
///
/// The resulting record has no socket addresses; dialing it relies on
/// whatever address lookup the endpoint is configured with.
pub fn seed_info(id: EndpointId) -> PeerInfo {
    PeerInfo {
        id,
        addr: EndpointAddr::from(id),
    }
}

/// The built-in seed set, used when a node is started with no seeds.
///
/// Kept injectable: bootstrap only consults this through
/// [`BootstrapConfig`], so tests and deployments can substitute their
/// own seeds without touching discovery internals.
pub fn default_seed_set() -> Vec<PeerInfo> {
    DEFAULT_SEED_IDS
        .iter()
        .filter_map(|raw| match raw.parse::<EndpointId>() {
            Ok(id) => Some(seed_info(id)),
            Err(err) => {
                warn!(seed = raw, "skipping unparseable built-in seed: {err}");
                None
            }
        })
        .collect()
}
