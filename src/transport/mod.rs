//! Transport Module
//!
//! Moves digests and deltas between peers. Outbound sends go through the
//! [`Transport`] trait; inbound traffic arrives as [`TransportEvent`]s on an
//! mpsc channel that the engine pumps. The wire format is a length-prefixed,
//! checksummed bincode frame.

mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::{Delta, PeerRef, PeerSummary};

/// Outbound half of the transport seam
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a digest to the target peer
    async fn send_digest(
        &self,
        target: &PeerRef,
        sender: PeerSummary,
        digest: Vec<PeerSummary>,
    ) -> Result<()>;

    /// Send a delta batch to the target peer
    async fn send_deltas(
        &self,
        target: &PeerRef,
        sender: PeerSummary,
        deltas: Vec<Delta>,
    ) -> Result<()>;
}

/// Inbound traffic surfaced by a transport implementation
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A digest arrived from a remote peer
    Digest {
        from: PeerRef,
        digest: Vec<PeerSummary>,
    },

    /// A delta batch arrived from a remote peer
    Deltas { from: PeerRef, deltas: Vec<Delta> },

    /// The transport hit an asynchronous fault
    Error(String),
}

/// Protocol messages exchanged between gossip endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Digest exchange: what the sender knows, per peer
    Digest {
        from: PeerRef,
        digest: Vec<PeerSummary>,
    },

    /// Delta batch answering a digest
    Deltas { from: PeerRef, deltas: Vec<Delta> },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Digest { .. } => "Digest",
            Message::Deltas { .. } => "Deltas",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().expect("header slice is 4 bytes")),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().expect("header slice is 4 bytes")),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Transport("Message checksum mismatch".into()));
    }

    Message::deserialize(&body)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn sample_digest() -> Message {
        Message::Digest {
            from: PeerRef {
                id: "node-1".into(),
                address: "10.0.0.1:7654".into(),
            },
            digest: vec![PeerSummary {
                id: "node-2".into(),
                max_version_seen: 4,
                address: "10.0.0.2:7654".into(),
            }],
        }
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::Deltas {
            from: PeerRef {
                id: "node-1".into(),
                address: "10.0.0.1:7654".into(),
            },
            deltas: vec![Delta {
                peer_id: "node-2".into(),
                key: "status".into(),
                value: Value::Text("up".into()),
                version: 3,
            }],
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::Deltas { from, deltas } => {
                assert_eq!(from.id, "node-1");
                assert_eq!(deltas.len(), 1);
                assert_eq!(deltas[0].version, 3);
                assert_eq!(deltas[0].value, Value::Text("up".into()));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"gossip frame body";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = sample_digest();
        write_message(&mut client, &msg).await.unwrap();

        let restored = read_message(&mut server).await.unwrap();
        match restored {
            Message::Digest { from, digest } => {
                assert_eq!(from.id, "node-1");
                assert_eq!(digest.len(), 1);
                assert_eq!(digest[0].max_version_seen, 4);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(4096);

        let body = sample_digest().serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();
        client.flush().await.unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
