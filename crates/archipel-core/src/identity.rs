//! Node identity: the long-term key material and the NodeId derived from it.
//!
//! A node's stable identifier is the SHA-256 hash of its Ed25519 signing
//! public key, rendered as lowercase hex wherever it appears in JSON
//! payloads. The invariant `node_id == hash(signing_public)` is re-checked
//! every time a persisted identity is loaded.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, DhKeypair, SigningKeypair};

// ── NodeId ────────────────────────────────────────────────────────────────────

/// Stable 32-byte identifier of a participant: hash of its signing
/// public key. Raw bytes on the frame header, lowercase hex in payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive a NodeId from a signing public key.
    pub fn from_signing_public(signing_public: &[u8; 32]) -> Self {
        Self(crypto::hash(signing_public))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::BadNodeId(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::BadNodeId(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's long-lived identity record: signing keypair, key-agreement
/// keypair, and the NodeId derived from the former.
pub struct Identity {
    node_id: NodeId,
    signing: SigningKeypair,
    dh: DhKeypair,
}

/// On-disk identity blob. Private keys as lowercase hex; the node_id is
/// stored redundantly so a corrupted or hand-edited file is caught on load.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    node_id: String,
    signing_private: String,
    dh_private: String,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let signing = SigningKeypair::generate();
        let node_id = NodeId::from_signing_public(&signing.public());
        Self {
            node_id,
            signing,
            dh: DhKeypair::generate(),
        }
    }

    /// Load the identity from `path`, generating and persisting a new one
    /// if the file does not exist. The write is atomic (temp file then
    /// rename) so a crash never leaves a half-written identity.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate();
        identity.persist(path)?;
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IdentityError::Io(path.display().to_string(), e))?;
        let file: IdentityFile =
            serde_json::from_str(&text).map_err(|e| IdentityError::Parse(e.to_string()))?;

        let signing = SigningKeypair::from_private(decode_key(&file.signing_private)?);
        let dh = DhKeypair::from_private(decode_key(&file.dh_private)?);

        let derived = NodeId::from_signing_public(&signing.public());
        let stored: NodeId = file.node_id.parse()?;
        if derived != stored {
            return Err(IdentityError::NodeIdMismatch { stored, derived });
        }

        Ok(Self {
            node_id: derived,
            signing,
            dh,
        })
    }

    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let file = IdentityFile {
            node_id: self.node_id.to_string(),
            signing_private: hex::encode(*self.signing.private_bytes()),
            dh_private: hex::encode(*self.dh.private_bytes()),
        };
        let text =
            serde_json::to_string_pretty(&file).map_err(|e| IdentityError::Parse(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::Io(parent.display().to_string(), e))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| IdentityError::Io(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| IdentityError::Io(path.display().to_string(), e))?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn signing(&self) -> &SigningKeypair {
        &self.signing
    }

    pub fn dh(&self) -> &DhKeypair {
        &self.dh
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity io failure at {0}: {1}")]
    Io(String, std::io::Error),

    #[error("identity file is malformed: {0}")]
    Parse(String),

    #[error("invalid node id: {0}")]
    BadNodeId(String),

    #[error("invalid key material in identity file")]
    BadKey,

    #[error("identity file node id {stored} does not match derived {derived}")]
    NodeIdMismatch { stored: NodeId, derived: NodeId },
}

fn decode_key(hex_str: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(hex_str).map_err(|_| IdentityError::BadKey)?;
    bytes.try_into().map_err(|_| IdentityError::BadKey)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_hash_of_signing_public() {
        let identity = Identity::generate();
        assert_eq!(
            identity.node_id(),
            NodeId::from_signing_public(&identity.signing().public())
        );
    }

    #[test]
    fn node_id_hex_roundtrip() {
        let id = NodeId(crypto::hash(b"some key"));
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        // Wire rendering is lowercase hex.
        assert_eq!(id.to_string(), id.to_string().to_lowercase());
    }

    #[test]
    fn node_id_rejects_bad_hex() {
        assert!("not-hex".parse::<NodeId>().is_err());
        assert!("abcd".parse::<NodeId>().is_err());
    }

    #[test]
    fn persisted_identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();

        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.signing().public(), second.signing().public());
        assert_eq!(first.dh().public(), second.dh().public());
    }

    #[test]
    fn tampered_node_id_is_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        Identity::load_or_generate(&path).unwrap();

        // Swap the stored node_id for another value
        let text = std::fs::read_to_string(&path).unwrap();
        let mut file: IdentityFile = serde_json::from_str(&text).unwrap();
        file.node_id = hex::encode([0u8; 32]);
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let err = Identity::load_or_generate(&path).err().expect("load must fail");
        assert!(matches!(err, IdentityError::NodeIdMismatch { .. }));
    }
}
