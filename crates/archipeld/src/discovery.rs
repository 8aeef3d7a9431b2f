//! Discovery: periodic multicast announcements and their ingestion.
//!
//! Every node joins the well-known group and announces itself on a fixed
//! cadence; a pruning sweep on the same cadence evicts peers that have
//! gone quiet. Announcements are HELLO frames under the published MAC
//! key. Unverified HELLOs (bad MAC but parseable) may refresh a known
//! peer's address and nothing else; the trust store keeps pinned keys
//! safe automatically.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use archipel_core::frame::{self, FrameType, PUBLISHED_MAC_KEY};
use archipel_core::payload::{decode_key32, HelloPayload};
use archipel_services::peer::PeerInfo;
use archipel_services::trust::TrustStatus;
use archipel_services::NodeEvent;

use crate::node::NodeState;

/// Create the socket announcements are sent from.
pub fn make_announce_socket(ttl: u32) -> Result<std::net::UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())
        .context("bind()")?;
    socket.set_multicast_ttl_v4(ttl).context("IP_MULTICAST_TTL")?;
    // Same-host peers hear us through the loopback of the egress interface.
    socket
        .set_multicast_loop_v4(true)
        .context("IP_MULTICAST_LOOP")?;
    Ok(socket.into())
}

/// Create a socket joined to the discovery group.
///
/// Reuse flags allow several nodes on one host to share the well-known
/// port, which is how multi-node tests run.
pub fn make_listener_socket(group: Ipv4Addr, port: u16) -> Result<std::net::UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())
        .context("bind()")?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;
    Ok(socket.into())
}

/// Announce ourselves to the group on the configured cadence.
///
/// Runs forever; cancel by dropping the task handle.
pub async fn announce_loop(state: Arc<NodeState>, socket: UdpSocket, dest: SocketAddr) {
    let interval_secs = state.config.network.announce_interval_secs;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    tracing::info!(%dest, interval_secs, "discovery announce starting");

    loop {
        interval.tick().await;
        // Rebuilt each tick: the shared-file list changes over time.
        let bytes = state.local_hello();
        match socket.send_to(&bytes, dest).await {
            Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
            Err(e) => tracing::warn!(error = %e, "announcement send failed"),
        }
    }
}

/// Receive announcements and populate the peer table.
///
/// Runs forever; cancel by dropping the task handle.
pub async fn listen_loop(state: Arc<NodeState>, socket: UdpSocket) {
    let mut buf = vec![0u8; 64 * 1024];

    tracing::info!(
        group = %state.config.network.multicast_group,
        port = state.config.network.multicast_port,
        "discovery listener starting"
    );

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "discovery recv failed");
                continue;
            }
        };

        let Some(frame) = frame::parse(&buf[..len], PUBLISHED_MAC_KEY) else {
            tracing::trace!(%src, "undecodable discovery datagram");
            continue;
        };
        if frame.frame_type != FrameType::Hello {
            tracing::trace!(%src, "non-HELLO frame on discovery socket");
            continue;
        }

        match serde_json::from_slice::<HelloPayload>(&frame.payload) {
            Ok(hello) => {
                ingest_hello(&state, &hello, src.ip(), frame.verified);
            }
            Err(e) => tracing::trace!(%src, error = %e, "bad HELLO payload"),
        }
    }
}

/// Evict peers that have gone quiet, on the configured cadence.
pub async fn prune_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.config.network.prune_interval_secs,
    ));
    loop {
        interval.tick().await;
        let removed = state.peers.prune_dead();
        if !removed.is_empty() {
            tracing::info!(evicted = removed.len(), "pruned unresponsive peers");
        }
    }
}

/// Fold one HELLO into the peer table. Returns true for the first
/// sighting in this peer's lifetime (eviction resets the lifetime).
///
/// Shared by the discovery socket and the session transport; `verified`
/// HELLOs may pin keys and create entries, unverified ones are address
/// hints for peers we already know.
pub fn ingest_hello(
    state: &Arc<NodeState>,
    hello: &HelloPayload,
    src_ip: IpAddr,
    verified: bool,
) -> bool {
    if hello.node_id == state.node_id() {
        tracing::trace!("ignoring own announcement");
        return false;
    }

    if !verified {
        tracing::debug!(peer = %hello.node_id.short(), "unverified HELLO: address hint only");
        state
            .peers
            .touch_address(hello.node_id, src_ip, hello.tcp_port);
        return false;
    }

    let (Some(signing), Some(dh)) = (
        decode_key32(&hello.signing_public_key),
        decode_key32(&hello.dh_public_key),
    ) else {
        tracing::debug!(peer = %hello.node_id.short(), "HELLO with undecodable keys");
        return false;
    };

    let check = state.trust.check(hello.node_id, signing, dh);
    if check.status == TrustStatus::Mismatch {
        state.events.emit(NodeEvent::TrustAlert {
            node_id: hello.node_id,
        });
        // Keys stay pinned; the address may still move.
        state
            .peers
            .touch_address(hello.node_id, src_ip, hello.tcp_port);
        return false;
    }

    let newly_seen = state.peers.upsert(PeerInfo::new(
        hello.node_id,
        src_ip,
        hello.tcp_port,
        signing,
        dh,
        hello.shared_files.clone(),
    ));

    if newly_seen {
        tracing::info!(
            peer = %hello.node_id.short(),
            addr = %src_ip,
            port = hello.tcp_port,
            "peer discovered"
        );
        state.events.emit(NodeEvent::PeerDiscovered {
            node_id: hello.node_id,
        });
    }
    newly_seen
}
