//! Local file index: the registry of files this node serves.
//!
//! The directory scanner lives outside the core; whatever shares a file
//! calls [`FileIndex::share`] and the index keeps the manifest plus the
//! source path so CHUNK_REQ frames can be served straight from the
//! original file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use archipel_core::manifest::{Manifest, SharedFileSummary};

use crate::chunker::{self, ChunkerError};

/// One shared file: its manifest and where the bytes live.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub manifest: Manifest,
    pub path: PathBuf,
}

#[derive(Clone, Default)]
pub struct FileIndex {
    files: Arc<DashMap<String, SharedFile>>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file for sharing. Streams it once to build the
    /// manifest; re-sharing the same path refreshes the entry.
    pub fn share(&self, path: &Path) -> Result<Manifest, ChunkerError> {
        let manifest = chunker::create_manifest(path)?;
        tracing::info!(
            file = %manifest.file_name,
            file_id = %&manifest.file_id[..16],
            chunks = manifest.chunk_count,
            "file shared"
        );
        self.files.insert(
            manifest.file_id.clone(),
            SharedFile {
                manifest: manifest.clone(),
                path: path.to_path_buf(),
            },
        );
        Ok(manifest)
    }

    pub fn get(&self, file_id: &str) -> Option<SharedFile> {
        self.files.get(file_id).map(|f| f.clone())
    }

    /// Read one chunk of a shared file for a CHUNK_REQ.
    pub fn read_chunk(&self, file_id: &str, index: u32) -> Result<Vec<u8>, ChunkerError> {
        let shared = self
            .get(file_id)
            .ok_or_else(|| ChunkerError::BadPath(format!("unknown file id {file_id}")))?;
        chunker::read_chunk(&shared.path, index, shared.manifest.file_size)
    }

    /// Advertisement summaries for HELLO payloads.
    pub fn summaries(&self) -> Vec<SharedFileSummary> {
        self.files
            .iter()
            .map(|f| SharedFileSummary {
                file_id: f.manifest.file_id.clone(),
                file_name: f.manifest.file_name.clone(),
                file_size: f.manifest.file_size,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_and_serve_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("served.bin");
        std::fs::write(&path, vec![0xabu8; 1000]).unwrap();

        let index = FileIndex::new();
        let manifest = index.share(&path).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.summaries()[0].file_name, "served.bin");

        let chunk = index.read_chunk(&manifest.file_id, 0).unwrap();
        assert_eq!(chunk.len(), 1000);
        assert!(index.read_chunk("missing", 0).is_err());
    }
}
