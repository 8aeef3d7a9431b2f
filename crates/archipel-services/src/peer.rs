//! Peer table: the in-memory directory of currently known peers.
//!
//! One shared instance per node. Discovery, the session transport, and
//! the handshake all mutate it through these operations; DashMap
//! serializes each mutation, so a reader sees either the pre- or
//! post-upsert state, never an intermediate one.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use archipel_core::manifest::SharedFileSummary;
use archipel_core::payload::PeerSummary;
use archipel_core::NodeId;

/// Peers not seen within this window are evicted.
pub const PEER_TTL: Duration = Duration::from_secs(90);

/// Starting reputation for a newly discovered peer.
pub const DEFAULT_REPUTATION: u32 = 100;

/// Default reputation penalty step.
pub const PENALTY_STEP: u32 = 10;

/// Everything the node knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: NodeId,
    /// Last observed network address, from the most recent datagram or
    /// connection.
    pub addr: IpAddr,
    /// Last advertised TCP listening port.
    pub tcp_port: u16,
    pub signing_public: [u8; 32],
    pub dh_public: [u8; 32],
    pub shared_files: Vec<SharedFileSummary>,
    pub last_seen: Instant,
    /// Telemetry only; never consulted for routing.
    pub reputation: u32,
    /// Established by the handshake; dies with the entry.
    pub session_key: Option<[u8; 32]>,
}

impl PeerInfo {
    /// A fresh entry as built from a verified HELLO.
    pub fn new(
        node_id: NodeId,
        addr: IpAddr,
        tcp_port: u16,
        signing_public: [u8; 32],
        dh_public: [u8; 32],
        shared_files: Vec<SharedFileSummary>,
    ) -> Self {
        Self {
            node_id,
            addr,
            tcp_port,
            signing_public,
            dh_public,
            shared_files,
            last_seen: Instant::now(),
            reputation: DEFAULT_REPUTATION,
            session_key: None,
        }
    }
}

/// The peer table. Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: std::sync::Arc<DashMap<NodeId, PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Reputation and any established session
    /// key survive the update. Returns true when the peer was not
    /// previously present, which is the once-per-lifetime discovery edge.
    pub fn upsert(&self, mut info: PeerInfo) -> bool {
        let mut newly_seen = true;
        if let Some(existing) = self.peers.get(&info.node_id) {
            info.reputation = existing.reputation;
            info.session_key = existing.session_key;
            newly_seen = false;
        }
        self.peers.insert(info.node_id, info);
        newly_seen
    }

    /// Refresh only address, port, and liveness. This is all an
    /// unverified HELLO is allowed to change: pinned keys stay put.
    pub fn touch_address(&self, node_id: NodeId, addr: IpAddr, tcp_port: u16) {
        if let Some(mut entry) = self.peers.get_mut(&node_id) {
            entry.addr = addr;
            entry.tcp_port = tcp_port;
            entry.last_seen = Instant::now();
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<PeerInfo> {
        self.peers.get(node_id).map(|e| e.clone())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    /// All live peers. Stale entries are pruned first.
    pub fn get_active(&self) -> Vec<PeerInfo> {
        self.prune_dead();
        self.peers.iter().map(|e| e.clone()).collect()
    }

    /// Evict peers not seen within [`PEER_TTL`]. Returns the removed IDs.
    pub fn prune_dead(&self) -> Vec<NodeId> {
        let mut removed = Vec::new();
        self.peers.retain(|id, entry| {
            let dead = entry.last_seen.elapsed() > PEER_TTL;
            if dead {
                removed.push(*id);
            }
            !dead
        });
        removed
    }

    /// Install a session key on an existing entry. Returns false when
    /// the peer is unknown (evicted between handshake legs).
    pub fn set_session_key(&self, node_id: &NodeId, key: [u8; 32]) -> bool {
        match self.peers.get_mut(node_id) {
            Some(mut entry) => {
                entry.session_key = Some(key);
                true
            }
            None => false,
        }
    }

    pub fn session_key(&self, node_id: &NodeId) -> Option<[u8; 32]> {
        self.peers.get(node_id).and_then(|e| e.session_key)
    }

    /// Lower a peer's reputation, bounded below at zero.
    pub fn penalize(&self, node_id: &NodeId, delta: u32) {
        if let Some(mut entry) = self.peers.get_mut(node_id) {
            entry.reputation = entry.reputation.saturating_sub(delta);
            tracing::debug!(
                peer = %node_id.short(),
                reputation = entry.reputation,
                "peer penalized"
            );
        }
    }

    /// Address/port/key/shared-file summaries for a PEER_LIST frame.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .iter()
            .map(|e| PeerSummary {
                node_id: e.node_id,
                address: e.addr.to_string(),
                tcp_port: e.tcp_port,
                dh_public_key: hex::encode(e.dh_public),
                signing_public_key: hex::encode(e.signing_public),
                shared_files: e.shared_files.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use archipel_core::crypto::hash;
    use std::net::Ipv4Addr;

    fn peer(tag: &[u8]) -> PeerInfo {
        PeerInfo::new(
            NodeId(hash(tag)),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            7777,
            [1u8; 32],
            [2u8; 32],
            vec![],
        )
    }

    #[test]
    fn upsert_reports_first_sighting_only() {
        let table = PeerTable::new();
        assert!(table.upsert(peer(b"a")));
        assert!(!table.upsert(peer(b"a")));
        assert!(table.upsert(peer(b"b")));
    }

    #[test]
    fn upsert_preserves_reputation_and_session_key() {
        let table = PeerTable::new();
        let p = peer(b"a");
        let id = p.node_id;
        table.upsert(p);

        table.penalize(&id, 30);
        assert!(table.set_session_key(&id, [9u8; 32]));

        // A later discovery refresh must not reset either field.
        table.upsert(peer(b"a"));
        let entry = table.get(&id).unwrap();
        assert_eq!(entry.reputation, 70);
        assert_eq!(entry.session_key, Some([9u8; 32]));
    }

    #[test]
    fn penalize_floors_at_zero() {
        let table = PeerTable::new();
        let id = peer(b"a").node_id;
        table.upsert(peer(b"a"));
        table.penalize(&id, 250);
        assert_eq!(table.get(&id).unwrap().reputation, 0);
    }

    #[test]
    fn stale_peers_are_pruned() {
        let table = PeerTable::new();
        let mut p = peer(b"old");
        let old_id = p.node_id;
        p.last_seen = Instant::now() - PEER_TTL - Duration::from_secs(1);
        table.peers.insert(p.node_id, p);
        table.upsert(peer(b"fresh"));

        let removed = table.prune_dead();
        assert_eq!(removed, vec![old_id]);
        assert_eq!(table.get_active().len(), 1);
    }

    #[test]
    fn eviction_discards_session_key_and_resets_lifetime() {
        let table = PeerTable::new();
        let p = peer(b"a");
        let id = p.node_id;
        table.upsert(p);
        table.set_session_key(&id, [9u8; 32]);

        // Force eviction, then rediscover.
        let mut stale = table.get(&id).unwrap();
        stale.last_seen = Instant::now() - PEER_TTL - Duration::from_secs(1);
        table.peers.insert(id, stale);
        table.prune_dead();

        assert!(table.upsert(peer(b"a")), "re-appearing peer is newly seen");
        assert_eq!(table.session_key(&id), None);
    }

    #[test]
    fn touch_address_never_replaces_keys() {
        let table = PeerTable::new();
        let p = peer(b"a");
        let id = p.node_id;
        table.upsert(p);

        table.touch_address(id, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 8888);
        let entry = table.get(&id).unwrap();
        assert_eq!(entry.addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(entry.tcp_port, 8888);
        assert_eq!(entry.signing_public, [1u8; 32]);
        assert_eq!(entry.dh_public, [2u8; 32]);
    }

    #[test]
    fn summaries_render_hex_keys() {
        let table = PeerTable::new();
        table.upsert(peer(b"a"));
        let summaries = table.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].dh_public_key, hex::encode([2u8; 32]));
        assert_eq!(summaries[0].tcp_port, 7777);
    }
}
