//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]
//!
//! Operations captured on a graph travel as one [`CommitGroup`] per
//! transaction. Control records (attach, detach, persist, state) share the
//! graph's queue with data operations, so each graph's stream is totally
//! ordered.

use crate::durability::TxPoint;
use crate::graph::{GraphCounts, GraphId};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted payload
pub const MAX_PAYLOAD_BYTES: usize = 64 << 20;

/// A captured operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A subscriber was attached
    Attach {
        /// Master serial at attach time
        master_serial: u64,
        /// Origin identifier of the provider
        origin: String,
    },
    /// All subscribers are being detached
    Detach {
        /// Master serial at detach time
        master_serial: u64,
    },
    /// A graph exists on the provider
    GraphCreated {
        /// Graph id
        graph: GraphId,
        /// Graph name
        name: String,
        /// Graph directory on the provider
        path: String,
        /// Inception (Unix seconds)
        inception: u64,
        /// Operation count at capture time
        opid: u64,
    },
    /// A graph was removed on the provider
    GraphDestroyed {
        /// Graph id
        graph: GraphId,
        /// Graph directory on the provider
        path: String,
    },
    /// Base counts of a graph
    State {
        /// Counts at capture time
        counts: GraphCounts,
    },
    /// A snapshot completed
    Persist {
        /// Last inbound transaction reflected in the snapshot
        durable: TxPoint,
        /// Snapshot completion time (Unix millis)
        persisted_ts: u64,
    },
    /// Topology or system state changed
    Modified,
    /// Opaque graph mutation
    Data {
        /// Operation code
        opcode: u32,
        /// Encoded operation
        payload: Vec<u8>,
    },
}

/// Operations committed together as one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitGroup {
    /// Graph the operations apply to
    pub graph: GraphId,
    /// Transaction id and serial
    pub tx: TxPoint,
    /// Master serial at commit time
    pub master_serial: u64,
    /// Operations in order
    pub ops: Vec<Operation>,
}

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Handshake from provider to subscriber
    Hello = 0x01,
    /// Handshake response from subscriber
    SubscriberInfo = 0x02,
    /// Committed transaction
    Transaction = 0x20,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::SubscriberInfo),
            0x20 => Ok(Self::Transaction),
            0xFF => Ok(Self::Error),
            _ => Err(Error::protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Hello from provider
    Hello {
        /// Provider origin identifier
        origin: String,
        /// Provider master serial
        master_serial: u64,
        /// Protocol version
        protocol_version: u32,
    },

    /// Subscriber description returned on handshake
    SubscriberInfo {
        /// Subscriber admin port
        adminport: u16,
        /// Subscriber content digest
        digest: String,
        /// Subscriber master serial
        master_serial: u64,
    },

    /// One committed transaction
    Transaction(CommitGroup),

    /// Error message
    Error {
        /// Error code
        code: u32,
        /// Description
        message: String,
    },
}

fn le_u32(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::protocol("Truncated frame field"))?;
    Ok(u32::from_le_bytes(arr))
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Hello { .. } => ReplicationMessageType::Hello,
            Self::SubscriberInfo { .. } => ReplicationMessageType::SubscriberInfo,
            Self::Transaction(_) => ReplicationMessageType::Transaction,
            Self::Error { .. } => ReplicationMessageType::Error,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::protocol(format!(
                "Message of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_PAYLOAD_BYTES
            )));
        }

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            // min: type(1) + length(4) + crc(4)
            return Err(Error::protocol("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = le_u32(&buf[crc_offset..])?;
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let msg_type = ReplicationMessageType::try_from(buf[0])?;
        let length = le_u32(&buf[1..5])? as usize;
        if buf.len() != 5 + length + 4 {
            return Err(Error::protocol("Incomplete message"));
        }

        let msg: Self = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))?;
        if msg.message_type() != msg_type {
            return Err(Error::protocol(format!(
                "Frame type {:?} does not match payload {:?}",
                msg_type,
                msg.message_type()
            )));
        }
        Ok(msg)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        // Read header: type(1) + length(4)
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;

        let length = le_u32(&header[1..5])? as usize;
        if length > MAX_PAYLOAD_BYTES {
            return Err(Error::protocol(format!("Frame length {} too large", length)));
        }

        // Read payload + CRC
        let mut full_buf = Vec::with_capacity(5 + length + 4);
        full_buf.extend_from_slice(&header);
        full_buf.resize(5 + length + 4, 0);
        reader.read_exact(&mut full_buf[5..]).await?;

        Self::decode(&full_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::durability::TxId;

    fn transaction() -> ReplicationMessage {
        ReplicationMessage::Transaction(CommitGroup {
            graph: GraphId(7),
            tx: TxPoint::new(TxId(99), 1234),
            master_serial: 1234,
            ops: vec![
                Operation::Attach {
                    master_serial: 1234,
                    origin: "provider".into(),
                },
                Operation::Modified,
                Operation::Data {
                    opcode: 3,
                    payload: vec![1, 2, 3],
                },
            ],
        })
    }

    #[test]
    fn test_transaction_encode_decode() {
        let msg = transaction();
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], ReplicationMessageType::Transaction as u8);
        assert_eq!(ReplicationMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = transaction().encode().unwrap();
        encoded[7] ^= 0xFF;
        let err = ReplicationMessage::decode(&encoded).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_short_message() {
        let err = ReplicationMessage::decode(&[1, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let hello = ReplicationMessage::Hello {
            origin: "p".into(),
            master_serial: 5,
            protocol_version: PROTOCOL_VERSION,
        };
        hello.write_to(&mut a).await.unwrap();
        transaction().write_to(&mut a).await.unwrap();
        assert_eq!(ReplicationMessage::read_from(&mut b).await.unwrap(), hello);
        assert_eq!(ReplicationMessage::read_from(&mut b).await.unwrap(), transaction());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![0x20u8];
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut a, &header).await.unwrap();
        let err = ReplicationMessage::read_from(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
