//! JSON payload schemas for every frame type.
//!
//! Field names here ARE the wire format; serde renames pin them to the
//! protocol's exact spelling (camelCase except the chunk request/data
//! bodies, which use snake_case on the wire). MSG payloads are
//! discriminated by an optional `type` string: handshake legs carry one,
//! chat bodies do not, and unknown `type` values are ignored rather than
//! rejected so newer peers can extend the protocol.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::manifest::{Manifest, SharedFileSummary};

/// Current time as Unix milliseconds, the timestamp unit of every payload.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Decode a 32-byte key from its lowercase hex payload rendering.
pub fn decode_key32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

/// Decode a 64-byte signature from hex.
pub fn decode_sig64(hex_str: &str) -> Option<[u8; 64]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

// ── HELLO ─────────────────────────────────────────────────────────────────────

/// Discovery announcement, broadcast over multicast and sent on manual
/// bootstrap connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub node_id: NodeId,
    /// Lowercase hex X25519 public key.
    pub dh_public_key: String,
    /// Lowercase hex Ed25519 public key.
    pub signing_public_key: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub shared_files: Vec<SharedFileSummary>,
    pub timestamp: u64,
}

// ── MSG bodies ────────────────────────────────────────────────────────────────

/// One handshake leg. `kind` is "HANDSHAKE_INIT" or "HANDSHAKE_RESP".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: NodeId,
    /// Lowercase hex Ed25519 public key.
    pub signing_pub: String,
    /// Lowercase hex static X25519 public key.
    pub dh_pub: String,
    /// Lowercase hex ephemeral X25519 public key, fresh per handshake.
    pub ephemeral_dh_pub: String,
    pub timestamp: u64,
}

pub const HANDSHAKE_INIT: &str = "HANDSHAKE_INIT";
pub const HANDSHAKE_RESP: &str = "HANDSHAKE_RESP";

/// Chat message body. When `nonce` is set, `ciphertext` is the hex AEAD
/// output with the tag appended; otherwise it is the plaintext itself.
/// The signature always covers the plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub ciphertext: String,
    pub nonce: Option<String>,
    pub signature: String,
    pub node_id: NodeId,
    pub timestamp: u64,
}

/// A parsed MSG payload, discriminated by the optional `type` field.
#[derive(Debug, Clone)]
pub enum MsgBody {
    HandshakeInit(HandshakePayload),
    HandshakeResp(HandshakePayload),
    Chat(ChatPayload),
    /// A `type` value this node does not know. Ignored, never an error.
    Unknown(String),
}

/// Interpret the payload of a MSG frame.
///
/// Returns None only for bodies that are not JSON objects at all; an
/// unknown `type` tag yields [`MsgBody::Unknown`] so the dispatcher can
/// skip it without tearing anything down.
pub fn parse_msg(payload: &[u8]) -> Option<MsgBody> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some(HANDSHAKE_INIT) => serde_json::from_value(value)
            .ok()
            .map(MsgBody::HandshakeInit),
        Some(HANDSHAKE_RESP) => serde_json::from_value(value)
            .ok()
            .map(MsgBody::HandshakeResp),
        Some(other) => Some(MsgBody::Unknown(other.to_string())),
        None => serde_json::from_value(value).ok().map(MsgBody::Chat),
    }
}

// ── PEER_LIST ─────────────────────────────────────────────────────────────────

/// One peer table entry as gossiped to a newly seen peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub node_id: NodeId,
    pub address: String,
    pub tcp_port: u16,
    pub dh_public_key: String,
    pub signing_public_key: String,
    #[serde(default)]
    pub shared_files: Vec<SharedFileSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<PeerSummary>,
}

// ── MANIFEST / CHUNK_REQ / CHUNK_DATA ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub manifest: Manifest,
}

impl ManifestPayload {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            kind: "MANIFEST".into(),
            manifest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReqPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub file_id: String,
    pub chunk_index: u32,
}

impl ChunkReqPayload {
    pub fn new(file_id: String, chunk_index: u32) -> Self {
        Self {
            kind: "CHUNK_REQ".into(),
            file_id,
            chunk_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDataPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub file_id: String,
    pub chunk_index: u32,
    /// Lowercase hex SHA-256 of the chunk bytes.
    pub hash: String,
    /// Base64 chunk bytes.
    pub data: String,
}

impl ChunkDataPayload {
    pub fn new(file_id: String, chunk_index: u32, hash: String, data: String) -> Self {
        Self {
            kind: "CHUNK_DATA".into(),
            file_id,
            chunk_index,
            hash,
            data,
        }
    }
}

// ── RELAY ─────────────────────────────────────────────────────────────────────

/// A store-and-forward envelope carried on behalf of an unreachable target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPayload {
    pub target: NodeId,
    pub sender: NodeId,
    pub content: String,
    pub timestamp: u64,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;

    fn node(tag: &[u8]) -> NodeId {
        NodeId(hash(tag))
    }

    #[test]
    fn handshake_init_has_wire_field_names() {
        let payload = HandshakePayload {
            kind: HANDSHAKE_INIT.into(),
            node_id: node(b"a"),
            signing_pub: hex::encode([1u8; 32]),
            dh_pub: hex::encode([2u8; 32]),
            ephemeral_dh_pub: hex::encode([3u8; 32]),
            timestamp: 7,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "HANDSHAKE_INIT");
        assert!(json.get("signingPub").is_some());
        assert!(json.get("dhPub").is_some());
        assert!(json.get("ephemeralDhPub").is_some());
    }

    #[test]
    fn msg_body_dispatches_on_type_tag() {
        let init = serde_json::json!({
            "type": "HANDSHAKE_INIT",
            "nodeId": node(b"a"),
            "signingPub": hex::encode([1u8; 32]),
            "dhPub": hex::encode([2u8; 32]),
            "ephemeralDhPub": hex::encode([3u8; 32]),
            "timestamp": 1,
        });
        let body = parse_msg(init.to_string().as_bytes()).unwrap();
        assert!(matches!(body, MsgBody::HandshakeInit(_)));
    }

    #[test]
    fn msg_body_without_type_is_chat() {
        let chat = serde_json::json!({
            "ciphertext": "hello",
            "nonce": null,
            "signature": hex::encode([0u8; 64]),
            "nodeId": node(b"a"),
            "timestamp": 1,
        });
        let body = parse_msg(chat.to_string().as_bytes()).unwrap();
        match body {
            MsgBody::Chat(c) => {
                assert_eq!(c.ciphertext, "hello");
                assert!(c.nonce.is_none());
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_is_ignored_not_rejected() {
        let future = serde_json::json!({ "type": "HOLOGRAM_SYNC", "blob": 42 });
        let body = parse_msg(future.to_string().as_bytes()).unwrap();
        assert!(matches!(body, MsgBody::Unknown(t) if t == "HOLOGRAM_SYNC"));
    }

    #[test]
    fn non_json_msg_payload_is_none() {
        assert!(parse_msg(b"\x00\x01binary").is_none());
    }

    #[test]
    fn chunk_req_uses_snake_case_on_the_wire() {
        let req = ChunkReqPayload::new("abc".into(), 4);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "CHUNK_REQ");
        assert!(json.get("file_id").is_some());
        assert!(json.get("chunk_index").is_some());
    }

    #[test]
    fn hello_round_trips() {
        let hello = HelloPayload {
            node_id: node(b"h"),
            dh_public_key: hex::encode([4u8; 32]),
            signing_public_key: hex::encode([5u8; 32]),
            tcp_port: 7777,
            shared_files: vec![],
            timestamp: now_millis(),
        };
        let bytes = serde_json::to_vec(&hello).unwrap();
        let back: HelloPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.node_id, hello.node_id);
        assert_eq!(back.tcp_port, 7777);
    }

    #[test]
    fn key_decoding_helpers() {
        assert_eq!(decode_key32(&hex::encode([9u8; 32])), Some([9u8; 32]));
        assert!(decode_key32("abcd").is_none());
        assert_eq!(decode_sig64(&hex::encode([7u8; 64])), Some([7u8; 64]));
    }
}
