//! Stream-to-socket bridge for connection-oriented RPC frameworks.
//!
//! RPC servers are built around "accept a connection, serve it until
//! close". A mesh node instead receives independent multiplexed
//! streams. The bridge reconciles the two models: every inbound
//! stream is wrapped in a [`SingleUseListener`], a listener with
//! exactly one pending connection, so the framework's unmodified
//! server loop accepts it, serves it, and then sees end-of-input.
//!
//! Multiplexed streams have no socket addresses to report, so the
//! bridge fabricates none: peer identity travels as the typed
//! [`PeerIdentity`] connect-info instead, which tonic surfaces to
//! handlers through request extensions.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use iroh::EndpointId;
use tonic::transport::server::Connected;

use crate::error::MeshError;
use crate::host::MeshStream;

/// Identity of the remote end of a bridged stream.
///
/// For a request handler running behind [`crate::rpc::RpcServer`]:
///
/// ```ignore
/// let identity = request
///     .extensions()
///     .get::<PeerIdentity>()
///     .expect("set for every bridged stream");
/// ```
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    /// The remote peer's mesh identifier.
    pub peer: EndpointId,
    /// The protocol identifier the stream was opened for.
    pub protocol: Vec<u8>,
}

impl Connected for MeshStream {
    type ConnectInfo = PeerIdentity;

    fn connect_info(&self) -> PeerIdentity {
        PeerIdentity {
            peer: self.remote(),
            protocol: self.protocol().to_vec(),
        }
    }
}

/// A connection-oriented socket facade over exactly one stream.
///
/// `accept` hands out the stream exactly once; every later call
/// reports [`MeshError::StreamClosed`] immediately rather than
/// blocking, since there is never a second connection to wait for.
/// The [`futures::Stream`] impl mirrors that contract (one item, then
/// the end of the stream) so tonic's `serve_with_incoming` entry
/// points consume the listener unmodified.
pub struct SingleUseListener<S> {
    // Single-capacity slot: the first taker wins.
    slot: Mutex<Option<S>>,
}

impl<S> SingleUseListener<S> {
    pub fn new(stream: S) -> Self {
        Self {
            slot: Mutex::new(Some(stream)),
        }
    }

    /// Take the pending connection. Succeeds exactly once per
    /// listener.
    pub fn accept(&self) -> Result<S, MeshError> {
        self.slot
            .lock()
            .unwrap()
            .take()
            .ok_or(MeshError::StreamClosed)
    }

    /// Drop the underlying stream, closing it if it was never
    /// accepted.
    pub fn close(&self) {
        self.slot.lock().unwrap().take();
    }
}

impl<S: Unpin> futures::Stream for SingleUseListener<S> {
    type Item = io::Result<S>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.slot.lock().unwrap().take().map(Ok))
    }
}
