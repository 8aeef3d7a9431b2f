//! Session transport: the reliable byte-stream layer between peers.
//!
//! One listener socket, one reader and one writer task per connection.
//! Each reader owns a reassembly buffer: wait for the 41-byte header,
//! learn the payload length, wait for the full frame, extract, repeat.
//! Partial frames stay buffered. The MAC key for each frame follows the
//! declared sender: an established session key when the peer table has
//! one, the published key otherwise, so pre-session HELLO and handshake
//! traffic parses before any key agreement has happened.
//!
//! Handler failures are logged and never close the socket.

pub mod handshake;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use archipel_core::frame::{self, Frame, FrameType, HEADER_LEN};
use archipel_core::payload::{
    self, ChunkDataPayload, HandshakePayload, ManifestPayload, MsgBody, PeerListPayload,
    RelayPayload,
};
use archipel_core::NodeId;
use archipel_services::peer::PeerInfo;
use archipel_services::trust::TrustStatus;
use archipel_services::NodeEvent;

use crate::discovery;
use crate::messaging;
use crate::node::NodeState;
use crate::transfer;

/// TCP connect timeout for outbound sessions.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// OS keep-alive probe interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How many ports past the configured one to try on a bind conflict.
const BIND_RETRY_SPAN: u16 = 32;

/// Minimum spacing between parse-failure warnings per connection.
const WARN_INTERVAL: Duration = Duration::from_secs(5);

// ── Connection table ──────────────────────────────────────────────────────────

/// Open sockets by peer, as outbound frame queues. Cheap to clone.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    map: Arc<DashMap<NodeId, mpsc::Sender<Vec<u8>>>>,
}

impl ConnectionTable {
    pub fn get(&self, node_id: &NodeId) -> Option<mpsc::Sender<Vec<u8>>> {
        self.map.get(node_id).map(|tx| tx.clone())
    }

    fn register(&self, node_id: NodeId, tx: mpsc::Sender<Vec<u8>>) {
        self.map.insert(node_id, tx);
    }

    /// Remove the mapping, but only if it still points at this channel;
    /// a replacement connection must not be unregistered by the old
    /// reader's teardown.
    fn remove_if(&self, node_id: &NodeId, tx: &mpsc::Sender<Vec<u8>>) {
        self.map
            .remove_if(node_id, |_, existing| existing.same_channel(tx));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop every outbound queue. Writer tasks end as their queues
    /// close, which closes the sockets under the readers.
    pub fn clear(&self) {
        self.map.clear();
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Bind the session listener, walking forward from `start_port` on
/// conflicts. Returns the listener and the port actually bound.
pub async fn bind_listener(start_port: u16) -> Result<(TcpListener, u16)> {
    for offset in 0..BIND_RETRY_SPAN {
        let port = start_port.saturating_add(offset);
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::info!(port, tried = start_port, "session port busy, moved up");
                }
                // Port 0 asks the OS to pick; report what was assigned.
                let bound = listener.local_addr().context("listener local_addr")?.port();
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e).context("session listener bind failed"),
        }
    }
    anyhow::bail!(
        "no free session port in {start_port}..{}",
        start_port + BIND_RETRY_SPAN
    )
}

/// Accept loop. Runs until the task is aborted.
pub async fn listener_loop(state: Arc<NodeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!(%peer_addr, "inbound session");
                spawn_connection(state.clone(), stream, None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Send one framed buffer to a peer, reusing an open socket when there
/// is one, otherwise dialing the address in the peer table. A fresh
/// connection drains any relay-queue entries addressed to that peer.
pub async fn send_to(state: &Arc<NodeState>, target: NodeId, bytes: Vec<u8>) -> Result<()> {
    if let Some(tx) = state.connections.get(&target) {
        if tx.send(bytes.clone()).await.is_ok() {
            return Ok(());
        }
        // Writer is gone; fall through and redial.
        state.connections.remove_if(&target, &tx);
    }

    let peer = state
        .peers
        .get(&target)
        .with_context(|| format!("peer {} unknown", target.short()))?;
    let addr = SocketAddr::new(peer.addr, peer.tcp_port);

    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect to {addr} timed out"))?
        .with_context(|| format!("connect to {addr} failed"))?;

    let tx = spawn_connection(state.clone(), stream, Some(target));
    tx.send(bytes)
        .await
        .map_err(|_| anyhow::anyhow!("connection to {} closed while sending", target.short()))?;

    flush_relay(state, &target).await;
    Ok(())
}

/// Manual bootstrap: open a connection to a bare address and introduce
/// ourselves with a HELLO. The peer replies symmetrically and discovery
/// proceeds from there.
pub async fn send_to_address(state: &Arc<NodeState>, addr: SocketAddr) -> Result<()> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect to {addr} timed out"))?
        .with_context(|| format!("connect to {addr} failed"))?;

    let tx = spawn_connection(state.clone(), stream, None);
    tx.send(state.local_hello())
        .await
        .map_err(|_| anyhow::anyhow!("connection to {addr} closed while sending hello"))?;
    Ok(())
}

/// Frame `payload` for `target` under the right MAC key and send it.
pub async fn send_frame(
    state: &Arc<NodeState>,
    target: NodeId,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<()> {
    let key = state.key_for(&target);
    let bytes = frame::build(frame_type, state.node_id(), payload, &key);
    send_to(state, target, bytes).await
}

/// Drain the relay queue for `target` over its open connection. Called
/// on fresh connections, inbound HELLOs, and both handshake legs; the
/// fetch deletes, so each envelope gets exactly one delivery attempt.
pub async fn flush_relay(state: &Arc<NodeState>, target: &NodeId) {
    let Some(tx) = state.connections.get(target) else {
        return;
    };

    let envelopes = match state.db.relay_fetch(target) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            tracing::warn!(error = %e, "relay fetch failed");
            return;
        }
    };
    if envelopes.is_empty() {
        return;
    }

    tracing::info!(
        peer = %target.short(),
        count = envelopes.len(),
        "draining relay queue"
    );
    let key = state.key_for(target);
    for envelope in envelopes {
        let Ok(body) = serde_json::to_vec(&envelope) else {
            continue;
        };
        let bytes = frame::build(FrameType::Relay, state.node_id(), &body, &key);
        if tx.send(bytes).await.is_err() {
            tracing::warn!(peer = %target.short(), "relay drain interrupted by socket close");
            break;
        }
    }
}

// ── Connection tasks ──────────────────────────────────────────────────────────

/// Wire up one TCP stream: keep-alive, a writer task fed by an mpsc
/// queue, and a reader task running the reassembly loop. Returns the
/// outbound queue handle.
pub fn spawn_connection(
    state: Arc<NodeState>,
    stream: TcpStream,
    known_peer: Option<NodeId>,
) -> mpsc::Sender<Vec<u8>> {
    let remote_ip = stream
        .peer_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "keep-alive setup failed");
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);

    if let Some(node_id) = known_peer {
        state.connections.register(node_id, tx.clone());
    }

    tokio::spawn(writer_loop(write_half, rx));
    tokio::spawn(reader_loop(state, read_half, remote_ip, tx.clone(), known_peer));

    tx
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            tracing::debug!(error = %e, "session write failed");
            break;
        }
    }
}

/// Per-socket receive loop: reassemble frames, pick the MAC key by the
/// declared sender, parse, dispatch. Socket close removes the peer's
/// connection mapping.
async fn reader_loop(
    state: Arc<NodeState>,
    mut read_half: OwnedReadHalf,
    remote_ip: IpAddr,
    tx: mpsc::Sender<Vec<u8>>,
    known_peer: Option<NodeId>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut registered = known_peer;
    let mut last_warn: Option<Instant> = None;

    'read: loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break 'read,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "session read failed");
                break 'read;
            }
        }

        while buf.len() >= HEADER_LEN {
            let Some(total) = frame::declared_len(&buf[..HEADER_LEN]) else {
                tracing::warn!(%remote_ip, "unframeable header, dropping connection");
                break 'read;
            };
            if buf.len() < total {
                break; // partial frame stays buffered
            }

            let frame_bytes = buf.copy_to_bytes(total);

            // The declared sender picks the MAC key before full parsing.
            let mut sender_bytes = [0u8; 32];
            sender_bytes.copy_from_slice(&frame_bytes[5..37]);
            let declared = NodeId(sender_bytes);
            let key = state.key_for(&declared);

            match frame::parse(&frame_bytes, &key) {
                Some(frame) => {
                    if frame.verified && registered != Some(frame.sender) {
                        state.connections.register(frame.sender, tx.clone());
                        registered = Some(frame.sender);
                    }
                    if let Err(e) = dispatch(&state, frame, remote_ip, &tx).await {
                        tracing::warn!(%remote_ip, error = %e, "frame handler failed");
                    }
                }
                None => {
                    let now = Instant::now();
                    if last_warn.map_or(true, |t| now.duration_since(t) >= WARN_INTERVAL) {
                        tracing::warn!(%remote_ip, "dropping unparseable frame");
                        last_warn = Some(now);
                    } else {
                        tracing::trace!(%remote_ip, "dropping unparseable frame");
                    }
                }
            }
        }
    }

    if let Some(node_id) = registered {
        state.connections.remove_if(&node_id, &tx);
        tracing::debug!(peer = %node_id.short(), "session closed");
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Route one parsed frame. Errors bubble to the reader, which logs them
/// and keeps the socket open.
async fn dispatch(
    state: &Arc<NodeState>,
    frame: Frame,
    remote_ip: IpAddr,
    conn_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    match frame.frame_type {
        FrameType::Hello => handle_hello(state, &frame, remote_ip, conn_tx).await,
        FrameType::Msg => handle_msg(state, &frame, remote_ip, conn_tx).await,
        FrameType::PeerList => handle_peer_list(state, &frame),
        FrameType::Manifest => handle_manifest(state, &frame),
        FrameType::ChunkReq => {
            let req = serde_json::from_slice(&frame.payload).context("bad CHUNK_REQ payload")?;
            transfer::serve_chunk(state, frame.sender, req, conn_tx).await;
            Ok(())
        }
        FrameType::ChunkData => {
            let data: ChunkDataPayload =
                serde_json::from_slice(&frame.payload).context("bad CHUNK_DATA payload")?;
            match state.chunk_handlers.get(&data.file_id) {
                Some(handler) => {
                    let _ = handler.send(data).await;
                }
                None => {
                    tracing::debug!(file_id = %&data.file_id[..16.min(data.file_id.len())],
                        "chunk data with no registered transfer, dropped");
                }
            }
            Ok(())
        }
        FrameType::Relay => handle_relay(state, &frame).await,
        FrameType::Ack => Ok(()),
    }
}

async fn handle_hello(
    state: &Arc<NodeState>,
    frame: &Frame,
    remote_ip: IpAddr,
    conn_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let hello = serde_json::from_slice(&frame.payload).context("bad HELLO payload")?;
    let newly_seen = discovery::ingest_hello(state, &hello, remote_ip, frame.verified);

    if newly_seen {
        // Reply so the initiator learns us symmetrically, then gossip
        // what we know of the neighborhood.
        let _ = conn_tx.send(state.local_hello()).await;

        let list = PeerListPayload {
            peers: state.peers.summaries(),
        };
        if let Ok(body) = serde_json::to_vec(&list) {
            let bytes = frame::build(
                FrameType::PeerList,
                state.node_id(),
                &body,
                &state.key_for(&frame.sender),
            );
            let _ = conn_tx.send(bytes).await;
        }
    }

    if frame.verified {
        flush_relay(state, &frame.sender).await;
    }
    Ok(())
}

async fn handle_msg(
    state: &Arc<NodeState>,
    frame: &Frame,
    remote_ip: IpAddr,
    conn_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let Some(body) = payload::parse_msg(&frame.payload) else {
        anyhow::bail!("MSG payload is not a JSON object");
    };

    match body {
        MsgBody::HandshakeInit(init) => {
            if !trust_gate(state, &init) {
                return Ok(());
            }
            let response = handshake::respond(state, &init, remote_ip)?;
            let _ = conn_tx.send(response).await;
            flush_relay(state, &frame.sender).await;
            Ok(())
        }
        MsgBody::HandshakeResp(resp) => {
            if !trust_gate(state, &resp) {
                return Ok(());
            }
            if let Some((_, waiter)) = state.pending_handshakes.remove(&resp.node_id) {
                let _ = waiter.send(resp);
            } else {
                tracing::debug!(peer = %frame.sender.short(), "unsolicited handshake response");
            }
            flush_relay(state, &frame.sender).await;
            Ok(())
        }
        MsgBody::Chat(chat) => {
            messaging::handle_chat(state, frame.sender, chat);
            Ok(())
        }
        MsgBody::Unknown(kind) => {
            tracing::debug!(kind, "unknown MSG variant ignored");
            Ok(())
        }
    }
}

/// Run the TOFU check for a handshake leg. A key mismatch rejects the
/// handshake (and alerts) but leaves the connection up.
fn trust_gate(state: &Arc<NodeState>, leg: &HandshakePayload) -> bool {
    let (Some(signing), Some(dh)) = (
        payload::decode_key32(&leg.signing_pub),
        payload::decode_key32(&leg.dh_pub),
    ) else {
        tracing::warn!(peer = %leg.node_id.short(), "handshake leg with undecodable keys");
        return false;
    };

    let check = state.trust.check(leg.node_id, signing, dh);
    if check.status == TrustStatus::Mismatch {
        state.events.emit(NodeEvent::TrustAlert {
            node_id: leg.node_id,
        });
        tracing::warn!(peer = %leg.node_id.short(), "handshake rejected: key mismatch");
        return false;
    }
    true
}

fn handle_peer_list(state: &Arc<NodeState>, frame: &Frame) -> Result<()> {
    let list: PeerListPayload =
        serde_json::from_slice(&frame.payload).context("bad PEER_LIST payload")?;

    for entry in list.peers {
        if entry.node_id == state.node_id() {
            continue;
        }
        let (Some(signing), Some(dh)) = (
            payload::decode_key32(&entry.signing_public_key),
            payload::decode_key32(&entry.dh_public_key),
        ) else {
            continue;
        };
        let Ok(addr) = entry.address.parse::<IpAddr>() else {
            continue;
        };

        let check = state.trust.check(entry.node_id, signing, dh);
        if check.status == TrustStatus::Mismatch {
            state.events.emit(NodeEvent::TrustAlert {
                node_id: entry.node_id,
            });
            continue;
        }

        let newly_seen = state.peers.upsert(PeerInfo::new(
            entry.node_id,
            addr,
            entry.tcp_port,
            signing,
            dh,
            entry.shared_files,
        ));
        if newly_seen {
            state.events.emit(NodeEvent::PeerDiscovered {
                node_id: entry.node_id,
            });
        }
    }
    Ok(())
}

fn handle_manifest(state: &Arc<NodeState>, frame: &Frame) -> Result<()> {
    let payload: ManifestPayload =
        serde_json::from_slice(&frame.payload).context("bad MANIFEST payload")?;
    let manifest = payload.manifest;
    manifest
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid manifest: {e}"))?;

    state.db.save_remote_manifest(&frame.sender, &manifest)?;
    tracing::info!(
        peer = %frame.sender.short(),
        file = %manifest.file_name,
        chunks = manifest.chunk_count,
        "remote manifest received"
    );
    state.events.emit(NodeEvent::ManifestReceived {
        from: frame.sender,
        file_id: manifest.file_id,
        file_name: manifest.file_name,
    });
    Ok(())
}

async fn handle_relay(state: &Arc<NodeState>, frame: &Frame) -> Result<()> {
    let envelope: RelayPayload =
        serde_json::from_slice(&frame.payload).context("bad RELAY payload")?;

    if envelope.target == state.node_id() {
        messaging::deliver_relayed(state, &envelope);
        return Ok(());
    }

    // Not for us: agree to carry it. The per-sender cap decides whether
    // it actually lands in the queue.
    let accepted = state.db.relay_enqueue(&envelope, state.relay_expiry())?;
    if accepted {
        tracing::debug!(
            target = %envelope.target.short(),
            origin = %envelope.sender.short(),
            "carrying relay envelope"
        );
    } else {
        tracing::warn!(
            origin = %envelope.sender.short(),
            "relay envelope refused: sender at queue cap"
        );
    }
    Ok(())
}
