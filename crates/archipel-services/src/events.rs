//! Event bus: the stream UI adapters subscribe to.
//!
//! Core components emit; any number of consumers subscribe. Emission
//! never blocks and never fails: with no subscribers the event is simply
//! dropped, which is correct for a headless node.

use std::path::PathBuf;

use tokio::sync::broadcast;

use archipel_core::NodeId;

/// Everything the core reports outward.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer entered the table for the first time in its lifetime.
    PeerDiscovered { node_id: NodeId },
    /// A chat (or relayed) message was delivered.
    MessageReceived {
        from: NodeId,
        message: String,
        encrypted: bool,
        /// Set when a signature was present but failed, or the sender's
        /// key is unknown; the text is delivered anyway, marked.
        tainted: bool,
    },
    /// TOFU key mismatch for a pinned node id.
    TrustAlert { node_id: NodeId },
    /// A remote manifest arrived and was persisted.
    ManifestReceived {
        from: NodeId,
        file_id: String,
        file_name: String,
    },
    /// One more verified chunk landed for an active download.
    TransferProgress {
        file_id: String,
        received: u32,
        total: u32,
    },
    /// A download completed and verified.
    TransferComplete { file_id: String, path: PathBuf },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: NodeEvent) {
        // Err means no live subscribers, which is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
