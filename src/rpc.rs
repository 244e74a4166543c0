//! RPC dispatch over mesh streams.
//!
//! Server side: [`RpcServer`] registers a stream handler for a
//! protocol identifier and runs one lightweight tonic server per
//! inbound stream, each fed by a [`SingleUseListener`] with exactly
//! one pending connection. Sessions are independent: a failure in one
//! never affects the others, and [`RpcServer::graceful_stop`] drains
//! whatever is still in flight.
//!
//! Client side: [`dial`] opens a stream through the host and hands it
//! to tonic's channel machinery through a connector that returns the
//! already-established stream; the channel's nominal target URI is
//! never dialed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use iroh::EndpointId;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::service::Routes;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tower::service_fn;
use tracing::{debug, info, warn};

use crate::bridge::SingleUseListener;
use crate::error::{MeshError, Result};
use crate::host::{MeshHost, MeshStream, StreamHandler};

/// Dispatcher for serving gRPC services over inbound mesh streams.
pub struct RpcServer {
    routes: Routes,
    health: HealthReporter,
    tracker: TaskTracker,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl RpcServer {
    /// Build a dispatcher around the given service routes.
    ///
    /// The standard gRPC health service is always merged in, so
    /// external monitors can distinguish "host up, RPC not yet ready"
    /// from "fully serving". Pass `Routes::default()` for a node that
    /// only answers health checks.
    pub fn new(routes: Routes) -> Self {
        let (health, health_service) = tonic_health::server::health_reporter();
        Self {
            routes: routes.add_service(health_service),
            health,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register this dispatcher for a protocol identifier on the host
    /// and flip the health status to SERVING.
    ///
    /// Every inbound stream on the protocol gets its own RPC session,
    /// concurrent with all others. The remote peer's identity is
    /// available to request handlers as the
    /// [`crate::bridge::PeerIdentity`] request extension.
    pub async fn serve(&self, host: &MeshHost, protocol: &[u8]) -> Result<()> {
        let handler = Arc::new(RpcStreamHandler {
            routes: self.routes.clone(),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        });
        host.set_stream_handler(protocol, handler).await;

        let mut health = self.health.clone();
        health.set_service_status("", ServingStatus::Serving).await;
        health
            .set_service_status(&String::from_utf8_lossy(protocol), ServingStatus::Serving)
            .await;

        info!(
            protocol = %String::from_utf8_lossy(protocol),
            "rpc dispatcher serving"
        );
        Ok(())
    }

    /// Stop accepting sessions and drain the in-flight ones.
    /// Idempotent.
    pub async fn graceful_stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping rpc dispatcher");
        let mut health = self.health.clone();
        health
            .set_service_status("", ServingStatus::NotServing)
            .await;
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// One tonic server per inbound stream.
struct RpcStreamHandler {
    routes: Routes,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl StreamHandler for RpcStreamHandler {
    async fn handle(&self, stream: MeshStream) -> anyhow::Result<()> {
        if self.tracker.is_closed() {
            debug!(peer = %stream.remote(), "dispatcher stopped, dropping inbound rpc stream");
            return Ok(());
        }
        let peer = stream.remote();
        debug!(peer = %peer, "inbound rpc stream");

        let listener = SingleUseListener::new(stream);
        let routes = self.routes.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let served = Server::builder()
                .add_routes(routes)
                .serve_with_incoming_shutdown(listener, cancel.cancelled_owned())
                .await;
            match served {
                Ok(()) => debug!(peer = %peer, "rpc session finished"),
                Err(err) => warn!(peer = %peer, "rpc session failed: {err}"),
            }
        });
        Ok(())
    }
}

/// Open a gRPC client channel to `peer` over a fresh mesh stream on
/// `protocol`.
///
/// Fails with [`MeshError::PeerUnreachable`] when the peer cannot be
/// resolved or the stream cannot be opened. The returned channel is
/// backed by exactly one stream; if tonic ever asks the connector for
/// a second connection (after the stream dies), the request fails
/// rather than silently redialing.
pub async fn dial(host: &MeshHost, peer: EndpointId, protocol: &[u8]) -> Result<Channel> {
    let stream = host.open_stream(peer, protocol).await?;

    let mut slot = Some(TokioIo::new(stream));
    let connector = service_fn(move |_: Uri| {
        let io = slot.take();
        async move {
            io.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "mesh stream already consumed")
            })
        }
    });

    // The URI is a placeholder; the connector above supplies the
    // already-open stream.
    let channel = Endpoint::from_static("http://mesh.invalid")
        .connect_with_connector(connector)
        .await
        .map_err(|err| MeshError::PeerUnreachable {
            peer,
            reason: err.to_string(),
        })?;
    Ok(channel)
}
