//! Transfer engine: pipelined chunk requests and verified reassembly.
//!
//! The receiver registers a per-file handler on the transport, fires a
//! CHUNK_REQ for every index up front, and verifies each CHUNK_DATA
//! against the manifest as it lands: a bad hash is re-requested, a
//! duplicate is dropped, and two minutes of silence aborts the whole
//! transfer. The sender side is stateless; every request is served
//! independently from the local file index.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

use archipel_core::crypto;
use archipel_core::frame::{self, FrameType};
use archipel_core::manifest::{Manifest, ManifestError};
use archipel_core::payload::{ChunkDataPayload, ChunkReqPayload, ManifestPayload};
use archipel_core::NodeId;
use archipel_services::chunker::{self, ChunkerError};
use archipel_services::peer::PENALTY_STEP;
use archipel_services::NodeEvent;

use crate::node::NodeState;
use crate::session;

/// Abort a download after this long without an accepted chunk.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Push one of our manifests to a peer.
pub async fn send_manifest(
    state: &Arc<NodeState>,
    target: NodeId,
    file_id: &str,
) -> Result<(), TransferError> {
    let shared = state
        .files
        .get(file_id)
        .ok_or_else(|| TransferError::UnknownFile(file_id.to_string()))?;

    let body = serde_json::to_vec(&ManifestPayload::new(shared.manifest))
        .map_err(|e| TransferError::Request(e.to_string()))?;
    session::send_frame(state, target, FrameType::Manifest, &body)
        .await
        .map_err(|e| TransferError::Request(e.to_string()))
}

/// Download the file a manifest describes from `peer`, returning the
/// path of the verified output in the downloads directory.
pub async fn download_file(
    state: &Arc<NodeState>,
    peer: NodeId,
    manifest: Manifest,
) -> Result<PathBuf, TransferError> {
    manifest.validate()?;

    if let Err(e) = state.db.save_remote_manifest(&peer, &manifest) {
        tracing::warn!(error = %e, "remote manifest persist failed");
    }

    let total = manifest.chunk_count;
    let mut buffers: Vec<Option<Vec<u8>>> = vec![None; total as usize];

    // Register before requesting; the first data frame can be fast.
    let (tx, mut rx) = mpsc::channel::<ChunkDataPayload>(64);
    state.chunk_handlers.insert(manifest.file_id.clone(), tx);
    let _guard = HandlerGuard {
        state: state.clone(),
        file_id: manifest.file_id.clone(),
    };

    tracing::info!(
        peer = %peer.short(),
        file = %manifest.file_name,
        chunks = total,
        "download starting"
    );

    // Pipelined: every request goes out up front, the OS socket buffer
    // is the only flow control.
    for chunk in &manifest.chunks {
        request_chunk(state, peer, &manifest.file_id, chunk.index).await?;
    }

    let mut received = 0u32;
    while received < total {
        let data = timeout(INACTIVITY_TIMEOUT, rx.recv())
            .await
            .map_err(|_| TransferError::Timeout { received, total })?
            .ok_or(TransferError::ChannelClosed)?;

        let index = data.chunk_index as usize;
        if index >= buffers.len() {
            tracing::debug!(index, "chunk index out of range, dropped");
            continue;
        }

        let Ok(bytes) = BASE64.decode(&data.data) else {
            tracing::warn!(index, "chunk data is not base64, re-requesting");
            let _ = request_chunk(state, peer, &manifest.file_id, data.chunk_index).await;
            continue;
        };

        if !chunker::verify_chunk(&bytes, &manifest.chunks[index].hash) {
            tracing::warn!(index, "chunk hash mismatch, re-requesting");
            state.peers.penalize(&peer, PENALTY_STEP);
            let _ = request_chunk(state, peer, &manifest.file_id, data.chunk_index).await;
            continue;
        }

        if buffers[index].is_some() {
            continue; // duplicate, drop silently
        }

        buffers[index] = Some(bytes);
        received += 1;
        state.events.emit(NodeEvent::TransferProgress {
            file_id: manifest.file_id.clone(),
            received,
            total,
        });
    }

    let out_path = chunker::assemble_file(&manifest, &buffers, &state.config.storage.downloads_dir)?;
    tracing::info!(
        file = %manifest.file_name,
        path = %out_path.display(),
        "download complete and verified"
    );
    state.events.emit(NodeEvent::TransferComplete {
        file_id: manifest.file_id.clone(),
        path: out_path.clone(),
    });
    Ok(out_path)
}

async fn request_chunk(
    state: &Arc<NodeState>,
    peer: NodeId,
    file_id: &str,
    index: u32,
) -> Result<(), TransferError> {
    let body = serde_json::to_vec(&ChunkReqPayload::new(file_id.to_string(), index))
        .map_err(|e| TransferError::Request(e.to_string()))?;
    session::send_frame(state, peer, FrameType::ChunkReq, &body)
        .await
        .map_err(|e| TransferError::Request(e.to_string()))
}

/// Serve one CHUNK_REQ from the local file index. Stateless; failures
/// are logged and the request is simply not answered.
pub async fn serve_chunk(
    state: &Arc<NodeState>,
    requester: NodeId,
    req: ChunkReqPayload,
    conn_tx: &mpsc::Sender<Vec<u8>>,
) {
    let bytes = match state.files.read_chunk(&req.file_id, req.chunk_index) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(
                requester = %requester.short(),
                error = %e,
                "chunk request not serviceable"
            );
            return;
        }
    };

    let payload = ChunkDataPayload::new(
        req.file_id,
        req.chunk_index,
        hex::encode(crypto::hash(&bytes)),
        BASE64.encode(&bytes),
    );
    let Ok(body) = serde_json::to_vec(&payload) else {
        return;
    };
    let framed = frame::build(
        FrameType::ChunkData,
        state.node_id(),
        &body,
        &state.key_for(&requester),
    );
    let _ = conn_tx.send(framed).await;
}

/// Deregisters the per-file chunk handler on every exit path.
struct HandlerGuard {
    state: Arc<NodeState>,
    file_id: String,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.state.chunk_handlers.remove(&self.file_id);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("file id {0} is not shared locally")]
    UnknownFile(String),

    #[error("chunk request failed: {0}")]
    Request(String),

    #[error("transfer stalled with {received}/{total} chunks")]
    Timeout { received: u32, total: u32 },

    #[error("transfer handler channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Assembly(#[from] ChunkerError),
}
