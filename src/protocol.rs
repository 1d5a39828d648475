//! Wire protocol for the collaboration channel and the cross-instance bus.
//!
//! Client frames are opaque byte strings whose first byte tags the kind:
//! ```text
//! ┌──────────┬────────────────────────────┐
//! │ kind     │ payload                    │
//! │ 1 byte   │ variable, never inspected  │
//! └──────────┴────────────────────────────┘
//! ```
//!
//! The server only ever looks at byte 0. Update/Awareness/Control payloads
//! travel verbatim; Snapshot payloads are additionally persisted with the
//! kind byte stripped. Server-originated control frames are a single kind
//! byte with no payload.

use serde::{Deserialize, Serialize};

/// Frame kinds carried over the client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Incremental CRDT update (opaque)
    Update = 0x01,
    /// Full document snapshot (opaque, persisted)
    Snapshot = 0x02,
    /// Presence JSON (opaque to the core)
    Awareness = 0x10,
    /// Join/leave JSON (opaque to the core)
    Control = 0x11,
    /// Server asks clients for a fresh snapshot
    RequestSnapshot = 0x20,
    /// Snapshot persistence failed
    SnapshotAckFail = 0x21,
    /// Snapshot persistence succeeded
    SnapshotAckOk = 0x22,
}

impl FrameKind {
    /// Tag a frame: the kind of `bytes` plus its payload tail.
    ///
    /// Returns `None` for empty frames (ignored by the core) and for tag
    /// bytes outside the table. Frames with unknown tags still fan out
    /// verbatim; the core just never interprets them.
    pub fn of(bytes: &[u8]) -> Option<(FrameKind, &[u8])> {
        let kind = match *bytes.first()? {
            0x01 => FrameKind::Update,
            0x02 => FrameKind::Snapshot,
            0x10 => FrameKind::Awareness,
            0x11 => FrameKind::Control,
            0x20 => FrameKind::RequestSnapshot,
            0x21 => FrameKind::SnapshotAckFail,
            0x22 => FrameKind::SnapshotAckOk,
            _ => return None,
        };
        Some((kind, &bytes[1..]))
    }

    /// A single-byte server-originated frame of this kind.
    pub fn frame(self) -> Vec<u8> {
        vec![self as u8]
    }
}

/// Bus channel name for a document room.
pub fn room_channel(doc_id: &str) -> String {
    format!("room:{doc_id}")
}

/// Message published on the bus for every frame a client sends.
///
/// Serialized as `{"type":"broadcast","docId":...,"data":...,"senderId":...}`
/// with `data` base64-encoded. `sender_id` is the connection tag of the
/// originating client on the originating instance; receivers use it to
/// suppress the loop-back copy of their own publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "docId")]
    pub doc_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "senderId")]
    pub sender_id: String,
}

/// The only message type defined on the bus.
pub const BUS_BROADCAST: &str = "broadcast";

impl BusMessage {
    /// Create a broadcast message for a frame sent by `sender_id`.
    pub fn broadcast(doc_id: &str, data: Vec<u8>, sender_id: &str) -> Self {
        Self {
            kind: BUS_BROADCAST.to_string(),
            doc_id: doc_id.to_string(),
            data,
            sender_id: sender_id.to_string(),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_values() {
        assert_eq!(FrameKind::Update as u8, 0x01);
        assert_eq!(FrameKind::Snapshot as u8, 0x02);
        assert_eq!(FrameKind::Awareness as u8, 0x10);
        assert_eq!(FrameKind::Control as u8, 0x11);
        assert_eq!(FrameKind::RequestSnapshot as u8, 0x20);
        assert_eq!(FrameKind::SnapshotAckFail as u8, 0x21);
        assert_eq!(FrameKind::SnapshotAckOk as u8, 0x22);
    }

    #[test]
    fn test_of_tags_and_tail() {
        let (kind, tail) = FrameKind::of(&[0x01, 0xAA, 0xBB]).unwrap();
        assert_eq!(kind, FrameKind::Update);
        assert_eq!(tail, &[0xAA, 0xBB]);

        let (kind, tail) = FrameKind::of(&[0x02]).unwrap();
        assert_eq!(kind, FrameKind::Snapshot);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_of_empty_is_none() {
        assert!(FrameKind::of(&[]).is_none());
    }

    #[test]
    fn test_of_unknown_tag_is_none() {
        assert!(FrameKind::of(&[0x7F, 1, 2]).is_none());
        assert!(FrameKind::of(&[0x00]).is_none());
    }

    #[test]
    fn test_server_frames_are_single_byte() {
        assert_eq!(FrameKind::RequestSnapshot.frame(), vec![0x20]);
        assert_eq!(FrameKind::SnapshotAckFail.frame(), vec![0x21]);
        assert_eq!(FrameKind::SnapshotAckOk.frame(), vec![0x22]);
    }

    #[test]
    fn test_room_channel_naming() {
        assert_eq!(room_channel("D1"), "room:D1");
    }

    #[test]
    fn test_bus_message_roundtrip() {
        let msg = BusMessage::broadcast("doc-7", vec![0x01, 0xAA], "0011223344556677");
        let encoded = msg.encode().unwrap();
        let decoded = BusMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, BUS_BROADCAST);
        assert_eq!(decoded.doc_id, "doc-7");
        assert_eq!(decoded.data, vec![0x01, 0xAA]);
        assert_eq!(decoded.sender_id, "0011223344556677");
    }

    #[test]
    fn test_bus_message_wire_fields() {
        use base64::Engine;

        let msg = BusMessage::broadcast("d", vec![1, 2, 3], "s");
        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "broadcast");
        assert_eq!(json["docId"], "d");
        assert_eq!(json["senderId"], "s");
        assert_eq!(
            json["data"],
            base64::engine::general_purpose::STANDARD.encode([1, 2, 3])
        );
    }

    #[test]
    fn test_bus_message_decode_garbage() {
        assert!(BusMessage::decode(b"not json").is_err());
        assert!(BusMessage::decode(b"{\"type\":\"broadcast\"}").is_err());
    }
}
