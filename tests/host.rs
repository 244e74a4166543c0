//! Host integration tests over real endpoints on localhost.

use std::sync::Arc;

use meshnet::protocol::{read_frame, write_frame};
use meshnet::{HostConfig, MeshError, MeshHost, MeshStream, PeerInfo, StreamHandler};

const ECHO_ALPN: &[u8] = b"/meshnet/echo/1.0.0";

/// Frame-level echo: answers every inbound frame with its payload.
struct EchoHandler;

#[async_trait::async_trait]
impl StreamHandler for EchoHandler {
    async fn handle(&self, mut stream: MeshStream) -> anyhow::Result<()> {
        while let Some(frame) = read_frame(&mut stream).await? {
            write_frame(&mut stream, &frame).await?;
        }
        stream.finish()?;
        Ok(())
    }
}

async fn echo_host() -> MeshHost {
    let host = MeshHost::bind(HostConfig {
        protocols: vec![ECHO_ALPN.to_vec()],
        ..Default::default()
    })
    .await
    .expect("bind echo host");
    host.set_stream_handler(ECHO_ALPN, Arc::new(EchoHandler)).await;
    host
}

async fn link(from: &MeshHost, to: &MeshHost) {
    let routing = from.routing();
    routing.write().await.update(to.peer_info());
}

#[tokio::test]
async fn fresh_host_reports_identity_and_addresses() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = MeshHost::bind(HostConfig::default()).await.expect("bind");

    let info: PeerInfo = host.peer_info();
    assert_eq!(info.id, host.local_id());

    let rendered = serde_json::to_string(&host.addresses()).expect("addresses serialize");
    assert!(!rendered.is_empty());

    host.close().await.expect("close");
}

#[tokio::test]
async fn open_stream_to_unknown_peer_fails_with_peer_unreachable() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = MeshHost::bind(HostConfig::default()).await.expect("bind");
    let stranger = common_stranger();

    match host.open_stream(stranger, ECHO_ALPN).await {
        Err(MeshError::PeerUnreachable { peer, .. }) => assert_eq!(peer, stranger),
        other => panic!("expected PeerUnreachable, got {other:?}"),
    }

    host.close().await.expect("close");
}

fn common_stranger() -> iroh::EndpointId {
    iroh::SecretKey::from_bytes(&[0x42; 32]).public()
}

#[tokio::test]
async fn streams_to_the_same_peer_do_not_interleave() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = echo_host().await;
    let client = MeshHost::bind(HostConfig {
        protocols: vec![ECHO_ALPN.to_vec()],
        ..Default::default()
    })
    .await
    .expect("bind client");
    link(&client, &server).await;

    let payload_one = vec![0xAB; 4096];
    let payload_two = vec![0xCD; 4096];

    let mut stream_one = client
        .open_stream(server.local_id(), ECHO_ALPN)
        .await
        .expect("first stream");
    let mut stream_two = client
        .open_stream(server.local_id(), ECHO_ALPN)
        .await
        .expect("second stream");

    // Write on both streams before reading either reply.
    write_frame(&mut stream_one, &payload_one).await.expect("write one");
    write_frame(&mut stream_two, &payload_two).await.expect("write two");

    let echoed_two = read_frame(&mut stream_two)
        .await
        .expect("read two")
        .expect("reply two");
    let echoed_one = read_frame(&mut stream_one)
        .await
        .expect("read one")
        .expect("reply one");

    assert_eq!(echoed_one, payload_one);
    assert_eq!(echoed_two, payload_two);

    client.close().await.expect("close client");
    server.close().await.expect("close server");
}

#[tokio::test]
async fn closing_one_stream_leaves_siblings_running() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = echo_host().await;
    let client = MeshHost::bind(HostConfig {
        protocols: vec![ECHO_ALPN.to_vec()],
        ..Default::default()
    })
    .await
    .expect("bind client");
    link(&client, &server).await;

    let mut doomed = client
        .open_stream(server.local_id(), ECHO_ALPN)
        .await
        .expect("doomed stream");
    let mut survivor = client
        .open_stream(server.local_id(), ECHO_ALPN)
        .await
        .expect("surviving stream");

    doomed.finish().expect("finish doomed");
    drop(doomed);

    write_frame(&mut survivor, b"still here").await.expect("write");
    let reply = read_frame(&mut survivor)
        .await
        .expect("read")
        .expect("reply");
    assert_eq!(reply, b"still here");

    client.close().await.expect("close client");
    server.close().await.expect("close server");
}

#[tokio::test]
async fn close_is_idempotent() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = MeshHost::bind(HostConfig::default()).await.expect("bind");
    host.close().await.expect("first close");
    host.close().await.expect("second close");

    // A closed host refuses new streams.
    match host.open_stream(common_stranger(), ECHO_ALPN).await {
        Err(MeshError::HostClosed) => {}
        other => panic!("expected HostClosed, got {other:?}"),
    }
}
