//! File manifests: the chunk layout and hashes a transfer is driven by.
//!
//! A manifest describes one shared file as a contiguous run of 512 KiB
//! chunks, each individually hashed, plus a whole-file hash. The file id
//! is derived from name and length only; it is deterministic and cheap
//! but not content-unique, and integrity never rests on it because the
//! whole-file hash is checked after reassembly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto;

/// Fixed chunk size for every transfer. Wire format; do not change.
pub const CHUNK_SIZE: u64 = 512 * 1024;

/// One chunk's position and hash inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub index: u32,
    pub offset: u64,
    pub size: u32,
    /// Lowercase hex SHA-256 of the chunk bytes.
    pub hash: String,
}

/// Metadata describing a file's chunk layout and hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    /// Lowercase hex SHA-256 of the entire file.
    pub file_hash: String,
    pub chunks: Vec<ChunkInfo>,
}

/// Derive the deterministic file id: SHA-256 over the file name
/// concatenated with the decimal length, rendered lowercase hex.
pub fn file_id(file_name: &str, file_size: u64) -> String {
    hex::encode(crypto::hash(format!("{file_name}{file_size}").as_bytes()))
}

impl Manifest {
    /// Check the structural invariants: contiguous indices from zero,
    /// offsets matching the running total, chunk sizes summing to the
    /// file size, and a chunk count agreeing with the descriptor list.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.chunks.len() != self.chunk_count as usize {
            return Err(ManifestError::ChunkCount {
                declared: self.chunk_count,
                actual: self.chunks.len(),
            });
        }

        let mut offset = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != i {
                return Err(ManifestError::NonContiguous { at: i });
            }
            if chunk.offset != offset {
                return Err(ManifestError::BadOffset { index: chunk.index });
            }
            offset += chunk.size as u64;
        }

        if offset != self.file_size {
            return Err(ManifestError::SizeMismatch {
                declared: self.file_size,
                summed: offset,
            });
        }
        Ok(())
    }
}

/// Compact advertisement of a shared file, carried in HELLO payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFileSummary {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest declares {declared} chunks but lists {actual}")]
    ChunkCount { declared: u32, actual: usize },

    #[error("chunk indices are not contiguous at position {at}")]
    NonContiguous { at: usize },

    #[error("chunk {index} offset disagrees with the running total")]
    BadOffset { index: u32 },

    #[error("chunk sizes sum to {summed}, file size is {declared}")]
    SizeMismatch { declared: u64, summed: u64 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
