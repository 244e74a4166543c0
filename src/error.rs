//! Error types for the mesh transport layer.

use iroh::EndpointId;
use thiserror::Error;

/// Errors surfaced by the mesh transport.
///
/// Only [`MeshError::BindFailure`] and [`MeshError::BootstrapUnreachable`]
/// are fatal to a node; everything else is returned per call and leaves the
/// host running.
#[derive(Debug, Error)]
pub enum MeshError {
    /// No requested listen address could be bound at startup.
    #[error("no listen address could be bound: {0}")]
    BindFailure(String),

    /// None of the attempted bootstrap seeds was reachable. The caller may
    /// retry with backoff, but the node is not part of the mesh until a
    /// later attempt succeeds.
    #[error("no bootstrap seed reachable ({attempted} attempted)")]
    BootstrapUnreachable { attempted: usize },

    /// The target peer has no known address in the routing table, or the
    /// dial to its recorded address failed.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: EndpointId, reason: String },

    /// The remote side closed the stream. RPC sessions treat this as a
    /// normal connection-closed event, not a transport fault.
    #[error("stream closed by remote")]
    StreamClosed,

    /// The peer answered with something the discovery protocol does not
    /// allow at this point in the exchange.
    #[error("unexpected discovery reply: {0}")]
    Protocol(String),

    /// The host has already been closed.
    #[error("host is closed")]
    HostClosed,

    /// A wire message failed to encode or decode.
    #[error("malformed wire message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshError>;
