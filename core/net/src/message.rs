//! Wire messages exchanged between peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use peersync_common::{FolderPath, PeerAddress, PeerRef};
use peersync_storage::ContentHash;

/// Next-chunk value meaning "transfer complete and verified".
pub const CHUNK_DONE: i64 = -1;

/// Process-wide unique identifier of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One step of a chunked transfer.
///
/// Carried by push requests and demand responses alike. Directories have
/// `total_chunks == 0` and no payload. The checksum travels on the final
/// chunk only; `None` there means the receiver must not verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub path: FolderPath,
    pub is_file: bool,
    pub chunk_index: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub total_size: u64,
    pub payload: Vec<u8>,
    pub checksum: Option<ContentHash>,
}

impl Chunk {
    /// Whether this is the last step of its transfer.
    pub fn is_final(&self) -> bool {
        self.total_chunks == 0 || self.chunk_index + 1 >= self.total_chunks
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    SnapshotFetchRequest,
    SnapshotFetchResponse { archive: Vec<u8> },
    ElectionRequest { timestamp: DateTime<Utc> },
    ElectionResponse { accepted: bool },
    ChunkPushRequest(Chunk),
    /// Next chunk index the receiver wants, `CHUNK_DONE` when finished.
    ChunkPushResponse { next_chunk: i64 },
    ChunkDemandRequest { path: FolderPath, chunk_index: u64 },
    ChunkDemandResponse(Chunk),
    PathDeleteRequest { path: FolderPath },
    PathDeleteResponse { accepted: bool },
    PathMoveRequest {
        old_path: FolderPath,
        new_path: FolderPath,
        is_file: bool,
    },
    PathMoveResponse { accepted: bool },
    ReconciliationStarted { leader: PeerRef },
    ReconciliationResult { archive: Vec<u8> },
    ReconciliationComplete,
    Ack,
    /// The responder could not serve the request.
    Refused { reason: String },
}

impl Message {
    /// Whether this body answers a request rather than starting one.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::SnapshotFetchResponse { .. }
                | Message::ElectionResponse { .. }
                | Message::ChunkPushResponse { .. }
                | Message::ChunkDemandResponse(_)
                | Message::PathDeleteResponse { .. }
                | Message::PathMoveResponse { .. }
                | Message::Ack
                | Message::Refused { .. }
        )
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SnapshotFetchRequest => "SnapshotFetchRequest",
            Message::SnapshotFetchResponse { .. } => "SnapshotFetchResponse",
            Message::ElectionRequest { .. } => "ElectionRequest",
            Message::ElectionResponse { .. } => "ElectionResponse",
            Message::ChunkPushRequest(_) => "ChunkPushRequest",
            Message::ChunkPushResponse { .. } => "ChunkPushResponse",
            Message::ChunkDemandRequest { .. } => "ChunkDemandRequest",
            Message::ChunkDemandResponse(_) => "ChunkDemandResponse",
            Message::PathDeleteRequest { .. } => "PathDeleteRequest",
            Message::PathDeleteResponse { .. } => "PathDeleteResponse",
            Message::PathMoveRequest { .. } => "PathMoveRequest",
            Message::PathMoveResponse { .. } => "PathMoveResponse",
            Message::ReconciliationStarted { .. } => "ReconciliationStarted",
            Message::ReconciliationResult { .. } => "ReconciliationResult",
            Message::ReconciliationComplete => "ReconciliationComplete",
            Message::Ack => "Ack",
            Message::Refused { .. } => "Refused",
        }
    }
}

/// A message in flight, addressed within one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub exchange: ExchangeId,
    /// Request round within the exchange; responses echo it.
    pub sequence: u64,
    pub sender: PeerRef,
    pub receivers: Vec<PeerAddress>,
    pub body: Message,
}

impl Envelope {
    /// Build the response to this request, sent by `responder`.
    pub fn reply(&self, responder: PeerRef, body: Message) -> Envelope {
        Envelope {
            exchange: self.exchange,
            sequence: self.sequence,
            sender: responder,
            receivers: vec![self.sender.address.clone()],
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_common::DeviceId;

    fn peer(device: &str) -> PeerRef {
        PeerRef::new(
            "alice",
            DeviceId::new(device).unwrap(),
            PeerAddress::new(format!("mem://{}", device)),
        )
    }

    #[test]
    fn test_exchange_ids_are_unique() {
        assert_ne!(ExchangeId::new(), ExchangeId::new());
    }

    #[test]
    fn test_reply_echoes_exchange_and_sequence() {
        let request = Envelope {
            exchange: ExchangeId::new(),
            sequence: 7,
            sender: peer("a"),
            receivers: vec![PeerAddress::new("mem://b")],
            body: Message::SnapshotFetchRequest,
        };

        let reply = request.reply(peer("b"), Message::Ack);
        assert_eq!(reply.exchange, request.exchange);
        assert_eq!(reply.sequence, 7);
        assert_eq!(reply.receivers, vec![PeerAddress::new("mem://a")]);
        assert!(reply.body.is_response());
        assert!(!request.body.is_response());
    }

    #[test]
    fn test_chunk_is_final() {
        let mut chunk = Chunk {
            path: FolderPath::parse("/a").unwrap(),
            is_file: true,
            chunk_index: 0,
            chunk_size: 4,
            total_chunks: 3,
            total_size: 10,
            payload: vec![0; 4],
            checksum: None,
        };
        assert!(!chunk.is_final());
        chunk.chunk_index = 2;
        assert!(chunk.is_final());

        chunk.total_chunks = 0;
        chunk.chunk_index = 0;
        assert!(chunk.is_final());
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope {
            exchange: ExchangeId::new(),
            sequence: 0,
            sender: peer("a"),
            receivers: vec![],
            body: Message::PathMoveRequest {
                old_path: FolderPath::parse("/x").unwrap(),
                new_path: FolderPath::parse("/y").unwrap(),
                is_file: true,
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
