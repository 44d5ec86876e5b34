//! Ridge wire format: every datagram exchanged between client and server.
//!
//! Packets are self-describing JSON objects tagged by `"type"`. Each variant
//! carries only the fields that are valid for it, so a DATA without a
//! checksum or a START without a chunk count cannot be decoded, let alone
//! built. Raw payload bytes travel as base64 because JSON strings cannot
//! hold arbitrary bytes.
//!
//! Sequence numbers: DATA chunks are numbered densely from 0 per transfer.
//! The control frames are acknowledged with reserved negative sequences,
//! START with -1 and END with -2.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checksum::{checksum, Checksum};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Sequence used to acknowledge START.
pub const START_SEQUENCE: i64 = -1;

/// Sequence used to acknowledge END.
pub const END_SEQUENCE: i64 = -2;

/// Largest DATA payload in bytes. Base64 plus the JSON envelope must still
/// fit in one UDP datagram.
pub const MAX_PAYLOAD: usize = 45 * 1024;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Receive buffer size for every ridge socket.
pub const RECV_BUFFER_SIZE: usize = 65_536;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// What an ACK acknowledges. On the wire this is the plain integer
/// `sequence` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Frame {
    Start,
    Chunk(u32),
    End,
}

impl From<Frame> for i64 {
    fn from(frame: Frame) -> i64 {
        match frame {
            Frame::Start => START_SEQUENCE,
            Frame::End => END_SEQUENCE,
            Frame::Chunk(seq) => i64::from(seq),
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Start => f.write_str("START"),
            Frame::End => f.write_str("END"),
            Frame::Chunk(seq) => write!(f, "chunk {seq}"),
        }
    }
}

impl TryFrom<i64> for Frame {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            START_SEQUENCE => Ok(Frame::Start),
            END_SEQUENCE => Ok(Frame::End),
            n => u32::try_from(n)
                .map(Frame::Chunk)
                .map_err(|_| ProtocolError::UnknownSequence(n)),
        }
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One datagram.
///
/// `client_port` is a logical return-routing hint: the server keys client
/// sessions on `(source ip, client_port)` when it is present, and on the UDP
/// source port otherwise. Server packets echo the port of the request they
/// belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Packet {
    /// Catalog request (no `files`) or reply (`files` present).
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<BTreeMap<String, u64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    /// Ask for bytes `[offset, offset + length)` of `file_name`.
    Download {
        file_name: String,
        offset: u64,
        length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    /// Opens a transfer. Acknowledged with `Frame::Start`.
    Start {
        file_name: String,
        transfer_id: u64,
        total_chunks: u32,
        offset: u64,
        length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    /// One chunk. `offset` is the absolute file offset of the first byte.
    Data {
        file_name: String,
        transfer_id: u64,
        sequence: u32,
        offset: u64,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
        checksum: Checksum,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    /// Closes a transfer. Acknowledged with `Frame::End`.
    End {
        file_name: String,
        transfer_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    Ack {
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<u64>,
        sequence: Frame,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    /// Chunk `sequence` failed its checksum; resend it.
    Nack {
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<u64>,
        sequence: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },

    /// Terminal failure of a request or transfer. Never retried.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<u64>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_port: Option<u16>,
    },
}

/// Packet type without its fields, for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    List,
    Download,
    Start,
    Data,
    End,
    Ack,
    Nack,
    Error,
}

impl Packet {
    /// Build a DATA packet. The checksum is always computed from `payload`.
    pub fn data(
        file_name: impl Into<String>,
        transfer_id: u64,
        sequence: u32,
        offset: u64,
        payload: Bytes,
    ) -> Self {
        let checksum = checksum(&payload);
        Packet::Data {
            file_name: file_name.into(),
            transfer_id,
            sequence,
            offset,
            payload,
            checksum,
            client_port: None,
        }
    }

    pub fn error(file_name: Option<String>, transfer_id: Option<u64>, reason: impl Into<String>) -> Self {
        Packet::Error {
            file_name,
            transfer_id,
            reason: reason.into(),
            client_port: None,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::List { .. } => PacketKind::List,
            Packet::Download { .. } => PacketKind::Download,
            Packet::Start { .. } => PacketKind::Start,
            Packet::Data { .. } => PacketKind::Data,
            Packet::End { .. } => PacketKind::End,
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::Nack { .. } => PacketKind::Nack,
            Packet::Error { .. } => PacketKind::Error,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            Packet::List { .. } => None,
            Packet::Error { file_name, .. } => file_name.as_deref(),
            Packet::Download { file_name, .. }
            | Packet::Start { file_name, .. }
            | Packet::Data { file_name, .. }
            | Packet::End { file_name, .. }
            | Packet::Ack { file_name, .. }
            | Packet::Nack { file_name, .. } => Some(file_name),
        }
    }

    pub fn transfer_id(&self) -> Option<u64> {
        match self {
            Packet::List { .. } | Packet::Download { .. } => None,
            Packet::Start { transfer_id, .. }
            | Packet::Data { transfer_id, .. }
            | Packet::End { transfer_id, .. } => Some(*transfer_id),
            Packet::Ack { transfer_id, .. }
            | Packet::Nack { transfer_id, .. }
            | Packet::Error { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn client_port(&self) -> Option<u16> {
        match self {
            Packet::List { client_port, .. }
            | Packet::Download { client_port, .. }
            | Packet::Start { client_port, .. }
            | Packet::Data { client_port, .. }
            | Packet::End { client_port, .. }
            | Packet::Ack { client_port, .. }
            | Packet::Nack { client_port, .. }
            | Packet::Error { client_port, .. } => *client_port,
        }
    }

    /// Return the packet with its routing hint replaced.
    pub fn with_client_port(mut self, port: Option<u16>) -> Self {
        match &mut self {
            Packet::List { client_port, .. }
            | Packet::Download { client_port, .. }
            | Packet::Start { client_port, .. }
            | Packet::Data { client_port, .. }
            | Packet::End { client_port, .. }
            | Packet::Ack { client_port, .. }
            | Packet::Nack { client_port, .. }
            | Packet::Error { client_port, .. } => *client_port = port,
        }
        self
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if let Packet::Data { payload, .. } = self {
            if payload.len() > MAX_PAYLOAD {
                return Err(ProtocolError::PayloadTooLarge(payload.len()));
            }
        }
        let bytes =
            serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(ProtocolError::DatagramTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parse one datagram. Anything malformed is a `ProtocolError`; callers
    /// drop the datagram and keep going.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let packet: Packet =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let Packet::Data { payload, .. } = &packet {
            if payload.len() > MAX_PAYLOAD {
                return Err(ProtocolError::PayloadTooLarge(payload.len()));
            }
        }
        Ok(packet)
    }
}

/// Parse one datagram into a packet.
pub fn parse_packet(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    Packet::decode(bytes)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A datagram that cannot be encoded or decoded. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("failed to encode packet: {0}")]
    Encode(String),

    #[error("unknown control sequence: {0}")]
    UnknownSequence(i64),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("encoded packet of {0} bytes does not fit in a datagram")]
    DatagramTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
