//! Node wiring: the shared state every task gets a handle to, and the
//! lifecycle of the daemon's task set.
//!
//! Nothing here is a global. `NodeState` is built once by [`Node::start`]
//! and injected into the discovery loops, the session transport, and the
//! operation entry points; each shared resource inside it serializes its
//! own mutation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use archipel_core::config::ArchipelConfig;
use archipel_core::frame::{self, FrameType, PUBLISHED_MAC_KEY};
use archipel_core::manifest::Manifest;
use archipel_core::payload::{now_millis, ChunkDataPayload, HandshakePayload, HelloPayload};
use archipel_core::{Identity, NodeId};
use archipel_services::{
    Database, EventBus, FileIndex, MessageRecord, NodeEvent, PeerTable, TrustStore,
};

use crate::discovery;
use crate::messaging::{self, SendOutcome};
use crate::session::{self, ConnectionTable};
use crate::transfer::{self, TransferError};

/// Everything the daemon's tasks share. One instance per node, always
/// behind an `Arc`.
pub struct NodeState {
    pub config: ArchipelConfig,
    pub identity: Identity,
    /// The session port actually bound (after conflict retries).
    pub tcp_port: u16,
    pub peers: PeerTable,
    pub trust: TrustStore,
    pub db: Arc<Database>,
    pub files: FileIndex,
    pub events: EventBus,
    pub connections: ConnectionTable,
    /// Initiators waiting for a HANDSHAKE_RESP, keyed by responder.
    pub pending_handshakes: DashMap<NodeId, oneshot::Sender<HandshakePayload>>,
    /// Active downloads' CHUNK_DATA routes, keyed by file id.
    pub chunk_handlers: DashMap<String, mpsc::Sender<ChunkDataPayload>>,
}

impl NodeState {
    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// The MAC key for traffic with `peer`: the established session key
    /// when there is one, the published key before that.
    pub fn key_for(&self, peer: &NodeId) -> Vec<u8> {
        self.peers
            .session_key(peer)
            .map(|k| k.to_vec())
            .unwrap_or_else(|| PUBLISHED_MAC_KEY.to_vec())
    }

    /// Our HELLO, framed and ready to send. Rebuilt on demand so the
    /// shared-file list is always current.
    pub fn local_hello(&self) -> Vec<u8> {
        let hello = HelloPayload {
            node_id: self.node_id(),
            dh_public_key: hex::encode(self.identity.dh().public()),
            signing_public_key: hex::encode(self.identity.signing().public()),
            tcp_port: self.tcp_port,
            shared_files: self.files.summaries(),
            timestamp: now_millis(),
        };
        let body = serde_json::to_vec(&hello).expect("hello payload serializes");
        frame::build(FrameType::Hello, self.node_id(), &body, PUBLISHED_MAC_KEY)
    }

    /// Expiry stamp for a relay envelope enqueued now.
    pub fn relay_expiry(&self) -> u64 {
        now_millis() + self.config.relay.ttl_hours * 60 * 60 * 1000
    }
}

/// A running node: its state handle and the tasks that animate it.
pub struct Node {
    state: Arc<NodeState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bring a node up: identity, store, session listener, discovery.
    ///
    /// A host without working multicast still starts; discovery is
    /// skipped with a warning and peers arrive via manual bootstrap.
    pub async fn start(config: ArchipelConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir).context("data dir")?;
        std::fs::create_dir_all(&config.storage.shared_dir).context("shared dir")?;
        std::fs::create_dir_all(&config.storage.downloads_dir).context("downloads dir")?;

        let identity =
            Identity::load_or_generate(&config.identity.identity_path).context("identity")?;
        tracing::info!(node_id = %identity.node_id(), "identity ready");

        let db = Arc::new(
            Database::open(
                &config.storage.data_dir.join("archipel.db"),
                config.relay.per_sender_cap,
            )
            .context("database")?,
        );
        let trust = TrustStore::new(db.clone());

        let (listener, tcp_port) = session::bind_listener(config.network.tcp_port).await?;
        tracing::info!(port = tcp_port, "session listener bound");

        let state = Arc::new(NodeState {
            config,
            identity,
            tcp_port,
            peers: PeerTable::new(),
            trust,
            db,
            files: FileIndex::new(),
            events: EventBus::new(),
            connections: ConnectionTable::default(),
            pending_handshakes: DashMap::new(),
            chunk_handlers: DashMap::new(),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(session::listener_loop(
            state.clone(),
            listener,
        )));
        tasks.push(tokio::spawn(discovery::prune_loop(state.clone())));

        match Self::discovery_tasks(&state) {
            Ok(mut discovery_tasks) => tasks.append(&mut discovery_tasks),
            Err(e) => {
                tracing::warn!(error = %e, "multicast unavailable, running without discovery");
            }
        }

        Ok(Self { state, tasks })
    }

    fn discovery_tasks(state: &Arc<NodeState>) -> Result<Vec<JoinHandle<()>>> {
        let network = &state.config.network;
        let group: std::net::Ipv4Addr = network
            .multicast_group
            .parse()
            .context("multicast group address")?;

        let listen_socket = discovery::make_listener_socket(group, network.multicast_port)?;
        let listen_socket =
            UdpSocket::from_std(listen_socket).context("discovery listener to tokio")?;

        let announce_socket = discovery::make_announce_socket(network.multicast_ttl)?;
        let announce_socket =
            UdpSocket::from_std(announce_socket).context("announce socket to tokio")?;
        let dest = SocketAddr::from((group, network.multicast_port));

        Ok(vec![
            tokio::spawn(discovery::listen_loop(state.clone(), listen_socket)),
            tokio::spawn(discovery::announce_loop(
                state.clone(),
                announce_socket,
                dest,
            )),
        ])
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn node_id(&self) -> NodeId {
        self.state.node_id()
    }

    pub fn tcp_port(&self) -> u16 {
        self.state.tcp_port
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn peers(&self) -> &PeerTable {
        &self.state.peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.state.events.subscribe()
    }

    // ── Operations ────────────────────────────────────────────────────────────

    /// Send a chat message; see [`messaging::send`] for the fallback
    /// semantics behind the outcome.
    pub async fn send_message(&self, target: NodeId, text: &str) -> Result<SendOutcome> {
        messaging::send(&self.state, target, text).await
    }

    /// Send to every active peer.
    pub async fn broadcast(&self, text: &str) -> Vec<(NodeId, SendOutcome)> {
        messaging::broadcast(&self.state, text).await
    }

    /// Register a local file for serving and return its manifest.
    pub fn share_file(&self, path: &Path) -> Result<Manifest> {
        Ok(self.state.files.share(path)?)
    }

    /// Push one of our manifests to a peer.
    pub async fn send_manifest(&self, target: NodeId, file_id: &str) -> Result<(), TransferError> {
        transfer::send_manifest(&self.state, target, file_id).await
    }

    /// Fetch the file a manifest describes.
    pub async fn download_file(
        &self,
        peer: NodeId,
        manifest: Manifest,
    ) -> Result<PathBuf, TransferError> {
        transfer::download_file(&self.state, peer, manifest).await
    }

    /// Run an explicit handshake; returns false on the 5 s timeout.
    pub async fn handshake(&self, target: NodeId) -> Result<bool> {
        session::handshake::initiate(&self.state, target).await
    }

    /// Manual bootstrap: introduce ourselves to a bare address.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        session::send_to_address(&self.state, addr).await
    }

    /// Message history with one peer, oldest first.
    pub fn history(&self, peer: &NodeId, limit: u32) -> Result<Vec<MessageRecord>> {
        Ok(self.state.db.history(peer, limit)?)
    }

    /// Operator trust override after a TOFU mismatch.
    pub fn set_trusted(&self, node_id: &NodeId, trusted: bool) -> bool {
        self.state.trust.set_trusted(node_id, trusted)
    }

    /// Stop the node: cancel every loop and drop the outbound queues so
    /// connection tasks unwind as their sockets close.
    pub async fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.state.connections.clear();
        tracing::info!(node_id = %self.state.node_id(), "node stopped");
    }
}
