//! Deterministic file slicing and reassembly.
//!
//! Files are cut into fixed 512 KiB chunks, each hashed on its own, with
//! a whole-file hash computed in the same single streaming pass. Assembly
//! verifies every chunk hash before writing and the whole-file hash after
//! writing; a whole-file mismatch deletes the partial output.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use archipel_core::crypto::{self, Hasher};
use archipel_core::manifest::{file_id, ChunkInfo, Manifest, CHUNK_SIZE};

/// Build a manifest for the file at `path`, streaming it once.
pub fn create_manifest(path: &Path) -> Result<Manifest, ChunkerError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ChunkerError::BadPath(path.display().to_string()))?
        .to_string();

    let mut file = File::open(path).map_err(|e| ChunkerError::Io(path.display().to_string(), e))?;
    let file_size = file
        .metadata()
        .map_err(|e| ChunkerError::Io(path.display().to_string(), e))?
        .len();

    let mut chunks = Vec::new();
    let mut whole = Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let mut offset = 0u64;
    let mut index = 0u32;

    while offset < file_size {
        let want = CHUNK_SIZE.min(file_size - offset) as usize;
        file.read_exact(&mut buf[..want])
            .map_err(|e| ChunkerError::Io(path.display().to_string(), e))?;

        whole.update(&buf[..want]);
        chunks.push(ChunkInfo {
            index,
            offset,
            size: want as u32,
            hash: hex::encode(crypto::hash(&buf[..want])),
        });

        offset += want as u64;
        index += 1;
    }

    Ok(Manifest {
        file_id: file_id(&file_name, file_size),
        file_name,
        file_size,
        chunk_size: CHUNK_SIZE as u32,
        chunk_count: chunks.len() as u32,
        file_hash: hex::encode(whole.finalize()),
        chunks,
    })
}

/// Read one chunk's bytes at its fixed offset.
pub fn read_chunk(path: &Path, index: u32, file_size: u64) -> Result<Vec<u8>, ChunkerError> {
    let offset = index as u64 * CHUNK_SIZE;
    if offset >= file_size {
        return Err(ChunkerError::ChunkOutOfRange { index });
    }
    let size = CHUNK_SIZE.min(file_size - offset) as usize;

    let mut file = File::open(path).map_err(|e| ChunkerError::Io(path.display().to_string(), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| ChunkerError::Io(path.display().to_string(), e))?;

    let mut buf = vec![0u8; size];
    file.read_exact(&mut buf)
        .map_err(|e| ChunkerError::Io(path.display().to_string(), e))?;
    Ok(buf)
}

/// Recompute and compare a chunk hash.
pub fn verify_chunk(bytes: &[u8], expected_hex: &str) -> bool {
    hex::encode(crypto::hash(bytes)) == expected_hex
}

/// Write a completed set of chunk buffers to `out_dir`, verifying each
/// chunk hash before writing and the whole-file hash afterwards. On a
/// whole-file mismatch the partial output is deleted.
///
/// `buffers[i]` must hold chunk `i`; a missing slot fails the assembly.
pub fn assemble_file(
    manifest: &Manifest,
    buffers: &[Option<Vec<u8>>],
    out_dir: &Path,
) -> Result<PathBuf, ChunkerError> {
    manifest
        .validate()
        .map_err(|e| ChunkerError::BadManifest(e.to_string()))?;
    if buffers.len() != manifest.chunk_count as usize {
        return Err(ChunkerError::MissingChunks {
            missing: manifest.chunk_count as usize - buffers.len().min(manifest.chunk_count as usize),
        });
    }

    std::fs::create_dir_all(out_dir)
        .map_err(|e| ChunkerError::Io(out_dir.display().to_string(), e))?;

    // A remote manifest names the file; only its final component is used,
    // so it can never escape the downloads directory.
    let safe_name = Path::new(&manifest.file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let out_path = out_dir.join(safe_name);

    let file = File::create(&out_path)
        .map_err(|e| ChunkerError::Io(out_path.display().to_string(), e))?;
    let mut writer = BufWriter::new(file);
    let mut whole = Hasher::new();

    for chunk in &manifest.chunks {
        let bytes = buffers[chunk.index as usize]
            .as_ref()
            .ok_or(ChunkerError::MissingChunks { missing: 1 })?;

        if bytes.len() != chunk.size as usize || !verify_chunk(bytes, &chunk.hash) {
            drop(writer);
            let _ = std::fs::remove_file(&out_path);
            return Err(ChunkerError::ChunkHashMismatch { index: chunk.index });
        }

        // Chunks are contiguous, so sequential writes land each one at
        // its declared offset.
        writer
            .write_all(bytes)
            .map_err(|e| ChunkerError::Io(out_path.display().to_string(), e))?;
        whole.update(bytes);
    }

    writer
        .flush()
        .map_err(|e| ChunkerError::Io(out_path.display().to_string(), e))?;

    let got = hex::encode(whole.finalize());
    if got != manifest.file_hash {
        let _ = std::fs::remove_file(&out_path);
        return Err(ChunkerError::FileHashMismatch {
            expected: manifest.file_hash.clone(),
            got,
        });
    }

    Ok(out_path)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("unusable path: {0}")]
    BadPath(String),

    #[error("io failure at {0}: {1}")]
    Io(String, std::io::Error),

    #[error("chunk index {index} is beyond the file")]
    ChunkOutOfRange { index: u32 },

    #[error("manifest failed validation: {0}")]
    BadManifest(String),

    #[error("{missing} chunk(s) missing from assembly")]
    MissingChunks { missing: usize },

    #[error("chunk {index} hash mismatch")]
    ChunkHashMismatch { index: u32 },

    #[error("whole-file hash mismatch: expected {expected}, got {got}")]
    FileHashMismatch { expected: String, got: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random bytes, enough to spot reordering bugs.
    fn test_bytes(len: usize) -> Vec<u8> {
        let mut state = 0x12345678u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn manifest_of_multi_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_bytes(CHUNK_SIZE as usize * 2 + 1000);
        let path = write_file(dir.path(), "data.bin", &data);

        let manifest = create_manifest(&path).unwrap();
        assert_eq!(manifest.chunk_count, 3);
        assert_eq!(manifest.file_size, data.len() as u64);
        assert_eq!(manifest.chunks[2].size, 1000);
        assert_eq!(manifest.chunks[1].offset, CHUNK_SIZE);
        assert_eq!(manifest.file_hash, hex::encode(crypto::hash(&data)));
        manifest.validate().unwrap();
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.bin", b"");
        let manifest = create_manifest(&path).unwrap();
        assert_eq!(manifest.chunk_count, 0);
        assert_eq!(manifest.file_size, 0);
        manifest.validate().unwrap();
    }

    #[test]
    fn read_chunk_returns_exact_windows() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_bytes(CHUNK_SIZE as usize + 100);
        let path = write_file(dir.path(), "data.bin", &data);

        let first = read_chunk(&path, 0, data.len() as u64).unwrap();
        assert_eq!(first, data[..CHUNK_SIZE as usize]);

        let last = read_chunk(&path, 1, data.len() as u64).unwrap();
        assert_eq!(last, data[CHUNK_SIZE as usize..]);

        assert!(read_chunk(&path, 2, data.len() as u64).is_err());
    }

    #[test]
    fn chunks_reassemble_to_identical_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_bytes(CHUNK_SIZE as usize + 4242);
        let path = write_file(dir.path(), "data.bin", &data);
        let manifest = create_manifest(&path).unwrap();

        let buffers: Vec<Option<Vec<u8>>> = (0..manifest.chunk_count)
            .map(|i| Some(read_chunk(&path, i, manifest.file_size).unwrap()))
            .collect();

        let out_dir = dir.path().join("downloads");
        let out_path = assemble_file(&manifest, &buffers, &out_dir).unwrap();
        assert_eq!(std::fs::read(&out_path).unwrap(), data);
    }

    #[test]
    fn corrupt_chunk_fails_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_bytes(2000);
        let path = write_file(dir.path(), "data.bin", &data);
        let manifest = create_manifest(&path).unwrap();

        let mut chunk = read_chunk(&path, 0, manifest.file_size).unwrap();
        chunk[7] ^= 0x01;

        let err = assemble_file(&manifest, &[Some(chunk)], dir.path()).unwrap_err();
        assert!(matches!(err, ChunkerError::ChunkHashMismatch { index: 0 }));
    }

    #[test]
    fn whole_file_mismatch_deletes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_bytes(2000);
        let path = write_file(dir.path(), "data.bin", &data);
        let mut manifest = create_manifest(&path).unwrap();
        // Per-chunk hashes pass but the declared whole-file hash is wrong.
        manifest.file_hash = hex::encode([0u8; 32]);

        let chunk = read_chunk(&path, 0, manifest.file_size).unwrap();
        let out_dir = dir.path().join("downloads");
        let err = assemble_file(&manifest, &[Some(chunk)], &out_dir).unwrap_err();
        assert!(matches!(err, ChunkerError::FileHashMismatch { .. }));
        assert!(!out_dir.join("data.bin").exists());
    }

    #[test]
    fn traversal_file_names_are_confined() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_bytes(100);
        let path = write_file(dir.path(), "data.bin", &data);
        let mut manifest = create_manifest(&path).unwrap();
        manifest.file_name = "../../escape.bin".into();

        let buffers = vec![Some(read_chunk(&path, 0, manifest.file_size).unwrap())];
        let out_dir = dir.path().join("downloads");
        let out_path = assemble_file(&manifest, &buffers, &out_dir).unwrap();
        assert!(out_path.starts_with(&out_dir));
        assert_eq!(out_path.file_name().unwrap(), "escape.bin");
    }
}
