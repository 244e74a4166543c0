//! Discovery wire protocol: JSON messages in length-prefixed frames.
//!
//! Every discovery exchange is one request frame followed by one reply
//! frame on a dedicated bi-directional stream. Requests carry the
//! sender's own [`PeerInfo`] so the responder can fold the caller into
//! its routing table.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MeshError, Result};
use crate::routing::{DhtId, PeerInfo};

/// Upper bound on a single frame. A discovery reply carries at most a
/// bucket's worth of address records, which is far below this.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A discovery message together with the sender's contact record.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerInfo,
    pub body: Message,
}

/// Discovery message bodies.
#[derive(Debug, Serialize, Deserialize)]
pub enum Message {
    /// Liveness probe.
    Ping,
    /// Reply to [`Message::Ping`].
    Pong,
    /// Ask for the peers closest to `target` in the responder's table.
    FindNode { target: DhtId },
    /// Reply to [`Message::FindNode`].
    Nodes { nodes: Vec<PeerInfo> },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_LEN {
        return Err(MeshError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        )));
    }
    writer.write_u32_le(data.len() as u32).await?;
    writer.write_all(data).await?;
    Ok(())
}

/// Read one frame, or `None` if the stream was cleanly closed before a
/// length prefix arrived.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(MeshError::Protocol(format!(
            "peer announced frame of {len} bytes"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, env: &Envelope) -> Result<()> {
    let bytes = serde_json::to_vec(env)?;
    write_frame(writer, &bytes).await
}

/// Read one envelope, or `None` on clean end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    match read_frame(reader).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
