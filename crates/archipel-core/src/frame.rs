//! Archipel wire format: the framed packet every byte on the network uses.
//!
//! A frame is:
//!
//!   MAGIC(4)="ARCH" | TYPE(1) | NODE_ID(32) | PAYLOAD_LEN(4, BE) | PAYLOAD(N) | MAC(32)
//!
//! The MAC is HMAC-SHA256 over everything that precedes it. Discovery
//! frames (HELLO) are accepted with a failing MAC but flagged unverified,
//! because a HELLO must be parseable before any session key exists;
//! consumers treat unverified HELLOs as address hints only. Every other
//! type drops silently on MAC failure.
//!
//! The header layout is fixed at 41 bytes and guarded at compile time.
//! There is no unsafe code in this module.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::NodeId;

type HmacSha256 = Hmac<Sha256>;

/// Frame magic, first four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"ARCH";

/// Fixed header length: magic + type + node id + payload length.
pub const HEADER_LEN: usize = 41;

/// HMAC-SHA256 trailer length.
pub const MAC_LEN: usize = 32;

/// Shortest possible frame: header plus MAC around an empty payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + MAC_LEN;

/// The published MAC key every node shares for discovery and pre-session
/// frames. Replacing this constant isolates a deployment from strangers.
pub const PUBLISHED_MAC_KEY: &[u8] = b"archipel-published-frame-mac-key-v1";

// ── Frame types ───────────────────────────────────────────────────────────────

/// The eight frame types of the protocol. The byte values are wire
/// format; changing them is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    PeerList = 2,
    Msg = 3,
    ChunkReq = 4,
    ChunkData = 5,
    Manifest = 6,
    Ack = 7,
    Relay = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Hello),
            2 => Ok(FrameType::PeerList),
            3 => Ok(FrameType::Msg),
            4 => Ok(FrameType::ChunkReq),
            5 => Ok(FrameType::ChunkData),
            6 => Ok(FrameType::Manifest),
            7 => Ok(FrameType::Ack),
            8 => Ok(FrameType::Relay),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed 41-byte frame header.
///
/// `payload_len` is stored as raw big-endian bytes so the struct has a
/// deterministic layout with no endianness surprises.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct FrameHeader {
    magic: [u8; 4],
    frame_type: u8,
    sender: [u8; 32],
    payload_len: [u8; 4],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 41]);

// ── Parsed frame ──────────────────────────────────────────────────────────────

/// In-memory view of a validated wire frame. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sender: NodeId,
    pub payload: Bytes,
    /// False only for HELLO frames accepted under the discovery
    /// exception. Unverified frames may update address hints, nothing else.
    pub verified: bool,
}

// ── Build / parse ─────────────────────────────────────────────────────────────

/// Serialize a frame: header, payload, then HMAC-SHA256 of both under `key`.
pub fn build(frame_type: FrameType, sender: NodeId, payload: &[u8], key: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        magic: MAGIC,
        frame_type: frame_type as u8,
        sender: *sender.as_bytes(),
        payload_len: (payload.len() as u32).to_be_bytes(),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + MAC_LEN);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);

    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes());
    out
}

/// Parse one frame from `buf` under `key`.
///
/// Returns None when the buffer is too short, the magic mismatches, the
/// declared payload overruns the buffer, the type byte is unknown, or the
/// MAC fails on a non-HELLO frame. MAC verification is constant time.
pub fn parse(buf: &[u8], key: &[u8]) -> Option<Frame> {
    if buf.len() < MIN_FRAME_LEN {
        return None;
    }

    let header = FrameHeader::read_from_prefix(buf)?;
    if header.magic != MAGIC {
        return None;
    }

    let payload_len = u32::from_be_bytes(header.payload_len) as usize;
    let total = HEADER_LEN
        .checked_add(payload_len)?
        .checked_add(MAC_LEN)?;
    if total > buf.len() {
        return None;
    }

    let frame_type = FrameType::try_from(header.frame_type).ok()?;

    let signed = &buf[..HEADER_LEN + payload_len];
    let mac_bytes = &buf[HEADER_LEN + payload_len..total];

    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(signed);
    let verified = mac.verify_slice(mac_bytes).is_ok();

    if !verified && frame_type != FrameType::Hello {
        return None;
    }

    Some(Frame {
        frame_type,
        sender: NodeId(header.sender),
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + payload_len]),
        verified,
    })
}

/// Total frame length declared by a buffered header, once at least
/// [`HEADER_LEN`] bytes are available. Used by the transport's
/// reassembly loop to decide how many bytes one frame occupies.
pub fn declared_len(header: &[u8]) -> Option<usize> {
    let header = FrameHeader::read_from_prefix(header)?;
    let payload_len = u32::from_be_bytes(header.payload_len) as usize;
    HEADER_LEN.checked_add(payload_len)?.checked_add(MAC_LEN)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown frame type byte: 0x{0:02x}")]
    UnknownType(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
