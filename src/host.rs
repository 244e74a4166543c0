//! Transport host: node identity, listening endpoint, and stream
//! multiplexing.
//!
//! A [`MeshHost`] owns the QUIC endpoint, the accept loop, and every
//! stream opened through it. Each physical connection is negotiated
//! with a protocol identifier (ALPN) and carries any number of
//! independent bi-directional streams; closing one stream never
//! affects its siblings. Inbound streams are handed to the
//! [`StreamHandler`] registered for the connection's protocol, one
//! task per stream, so a failing handler takes down only its own
//! stream.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{MeshError, Result};
use crate::routing::{PeerInfo, RoutingTable, SharedRoutingTable};

// ============================================================================
// Identity
// ============================================================================

/// A node's cryptographic identity: an Ed25519 keypair whose public
/// key doubles as the node's mesh identifier.
///
/// Generated fresh per process unless a key is injected through
/// [`HostConfig::secret_key`]; the transport never persists it.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    secret: SecretKey,
}

impl NodeIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::generate(),
        }
    }

    /// Wrap an existing secret key, for callers that persist identity
    /// outside the transport.
    pub fn from_secret(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// The node's stable identifier, derived from the public key.
    pub fn peer_id(&self) -> EndpointId {
        self.secret.public()
    }
}

// ============================================================================
// Streams
// ============================================================================

/// A bi-directional, ordered byte channel tagged with the remote peer
/// and the protocol it was opened for.
///
/// Streams sharing a physical connection are independent; byte order
/// is preserved within a stream and unordered across streams.
pub struct MeshStream {
    remote: EndpointId,
    protocol: Vec<u8>,
    send: SendStream,
    recv: RecvStream,
}

impl MeshStream {
    /// Identity of the peer on the other end.
    pub fn remote(&self) -> EndpointId {
        self.remote
    }

    /// Protocol identifier this stream was opened for.
    pub fn protocol(&self) -> &[u8] {
        &self.protocol
    }

    /// Signal that no further data will be written. Reading may
    /// continue until the remote finishes its half.
    pub fn finish(&mut self) -> Result<()> {
        self.send.finish().map_err(|_| MeshError::StreamClosed)
    }
}

impl std::fmt::Debug for MeshStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshStream")
            .field("remote", &self.remote)
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .finish()
    }
}

impl AsyncRead for MeshStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for MeshStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// Handler invoked once per inbound stream on a registered protocol.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: MeshStream) -> anyhow::Result<()>;
}

// ============================================================================
// Host
// ============================================================================

/// The transport host. Cheap to clone; all clones share one endpoint.
#[derive(Clone)]
pub struct MeshHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    endpoint: Endpoint,
    alpns: Vec<Vec<u8>>,
    routing: SharedRoutingTable,
    handlers: RwLock<HashMap<Vec<u8>, Arc<dyn StreamHandler>>>,
    /// Pooled connections, one per (peer, protocol). Streams opened to
    /// the same peer and protocol multiplex over the pooled connection.
    conns: Mutex<HashMap<(EndpointId, Vec<u8>), Connection>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl MeshHost {
    /// Bind the endpoint and start the accept loop.
    ///
    /// Generates a [`NodeIdentity`] unless one is supplied. Fails with
    /// [`MeshError::BindFailure`] when the requested address cannot be
    /// bound. Logs the node identifier and its reachable address
    /// record for operator visibility.
    pub async fn bind(config: HostConfig) -> Result<MeshHost> {
        let identity = config
            .secret_key
            .map(NodeIdentity::from_secret)
            .unwrap_or_else(NodeIdentity::generate);

        let mut builder = Endpoint::builder(iroh::endpoint::presets::N0)
            .secret_key(identity.secret.clone())
            .alpns(config.protocols.clone());
        if config.port != 0 {
            builder = builder
                .bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))
                .map_err(|err| MeshError::BindFailure(err.to_string()))?;
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|err| MeshError::BindFailure(err.to_string()))?;

        info!(id = %endpoint.id(), "mesh host bound");
        match serde_json::to_string(&endpoint.addr()) {
            Ok(json) => info!(addr = %json, "listening"),
            Err(err) => warn!("could not render listen addresses: {err}"),
        }

        let inner = Arc::new(HostInner {
            routing: RoutingTable::shared(endpoint.id(), config.bucket_size),
            endpoint,
            alpns: config.protocols,
            handlers: RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(accept_loop(inner.clone()));

        Ok(MeshHost { inner })
    }

    /// The local node's identifier.
    pub fn local_id(&self) -> EndpointId {
        self.inner.endpoint.id()
    }

    /// The current reachable address record. May change over time as
    /// paths are discovered.
    pub fn addresses(&self) -> EndpointAddr {
        self.inner.endpoint.addr()
    }

    /// This node's own contact record, as shared with peers.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.local_id(),
            addr: self.addresses(),
        }
    }

    /// Handle to the routing table this host resolves dials through.
    pub fn routing(&self) -> SharedRoutingTable {
        self.inner.routing.clone()
    }

    /// The host-lifetime cancellation context. Cancelled by
    /// [`Self::close`]; background loops tied to the node's lifetime
    /// should watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Register the handler for a protocol identifier, replacing any
    /// previous one.
    pub async fn set_stream_handler(&self, protocol: &[u8], handler: Arc<dyn StreamHandler>) {
        if !self.inner.alpns.iter().any(|a| a == protocol) {
            warn!(
                protocol = %String::from_utf8_lossy(protocol),
                "protocol is not in the negotiated set; inbound streams will never reach it"
            );
        }
        let previous = self
            .inner
            .handlers
            .write()
            .await
            .insert(protocol.to_vec(), handler);
        if previous.is_some() {
            debug!(
                protocol = %String::from_utf8_lossy(protocol),
                "replaced existing stream handler"
            );
        }
    }

    /// Open an outbound stream to a peer on the given protocol.
    ///
    /// The peer's address must already be present in the routing
    /// table; otherwise this fails with [`MeshError::PeerUnreachable`].
    /// An existing connection to the peer is reused, with one redial
    /// if the pooled connection has died in the meantime.
    pub async fn open_stream(&self, peer: EndpointId, protocol: &[u8]) -> Result<MeshStream> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MeshError::HostClosed);
        }

        let conn = self.connection(peer, protocol).await?;
        match conn.open_bi().await {
            Ok((send, recv)) => Ok(MeshStream {
                remote: peer,
                protocol: protocol.to_vec(),
                send,
                recv,
            }),
            Err(err) => {
                debug!(peer = %peer, "pooled connection unusable, redialing: {err}");
                self.inner
                    .conns
                    .lock()
                    .await
                    .remove(&(peer, protocol.to_vec()));
                let conn = self.connection(peer, protocol).await?;
                let (send, recv) = conn
                    .open_bi()
                    .await
                    .map_err(|err| MeshError::PeerUnreachable {
                        peer,
                        reason: err.to_string(),
                    })?;
                Ok(MeshStream {
                    remote: peer,
                    protocol: protocol.to_vec(),
                    send,
                    recv,
                })
            }
        }
    }

    async fn connection(&self, peer: EndpointId, protocol: &[u8]) -> Result<Connection> {
        let key = (peer, protocol.to_vec());
        {
            let conns = self.inner.conns.lock().await;
            if let Some(conn) = conns.get(&key) {
                return Ok(conn.clone());
            }
        }

        let addr = {
            let routing = self.inner.routing.read().await;
            routing.get(&peer).map(|info| info.addr)
        }
        .ok_or_else(|| MeshError::PeerUnreachable {
            peer,
            reason: "no known address".into(),
        })?;

        let conn = self
            .inner
            .endpoint
            .connect(addr, protocol)
            .await
            .map_err(|err| MeshError::PeerUnreachable {
                peer,
                reason: err.to_string(),
            })?;
        self.inner.conns.lock().await.insert(key, conn.clone());
        Ok(conn)
    }

    /// Release the endpoint, every pooled connection, and in-flight
    /// streams. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(id = %self.local_id(), "closing mesh host");
        self.inner.cancel.cancel();
        {
            let mut conns = self.inner.conns.lock().await;
            for (_, conn) in conns.drain() {
                conn.close(0u8.into(), b"host closed");
            }
        }
        self.inner.endpoint.close().await;
        Ok(())
    }
}

// ============================================================================
// Accept loop
// ============================================================================

/// The host's long-lived accept task: one spawned unit per inbound
/// connection, which in turn spawns one unit per inbound stream.
async fn accept_loop(inner: Arc<HostInner>) {
    loop {
        let incoming = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            inc = inner.endpoint.accept() => match inc {
                Some(incoming) => incoming,
                None => break,
            },
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!("inbound connection failed during handshake: {err}");
                    return;
                }
            };
            if let Err(err) = serve_connection(inner, conn).await {
                debug!("inbound connection closed: {err:#}");
            }
        });
    }
    debug!("accept loop stopped");
}

async fn serve_connection(inner: Arc<HostInner>, conn: Connection) -> anyhow::Result<()> {
    let remote = conn.remote_id();
    let alpn = conn.alpn();
    if alpn.is_empty() {
        return Err(anyhow!("connection without negotiated protocol"));
    }
    let protocol = alpn.to_vec();

    let handler = inner.handlers.read().await.get(&protocol).cloned();
    let Some(handler) = handler else {
        warn!(
            peer = %remote,
            protocol = %String::from_utf8_lossy(&protocol),
            "no handler registered for protocol, dropping connection"
        );
        conn.close(0u8.into(), b"unsupported protocol");
        return Ok(());
    };

    debug!(
        peer = %remote,
        protocol = %String::from_utf8_lossy(&protocol),
        "accepted connection"
    );

    loop {
        let (send, recv) = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            bi = conn.accept_bi() => match bi {
                Ok(pair) => pair,
                // The remote closed the connection; sibling streams
                // already accepted keep running on their own tasks.
                Err(_) => break,
            },
        };
        let stream = MeshStream {
            remote,
            protocol: protocol.clone(),
            send,
            recv,
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle(stream).await {
                warn!(peer = %remote, "stream handler failed: {err:#}");
            }
        });
    }
    Ok(())
}
