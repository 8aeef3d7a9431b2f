//! Trust store: trust-on-first-use key pinning.
//!
//! The first key material seen for a NodeId is pinned. Any later sighting
//! with different keys clears `trusted` and keeps it cleared until an
//! operator re-asserts it; the pinned keys themselves never change under
//! a mismatch. A mismatch is an alert condition, not a connection abort;
//! the transport decides policy per frame type.
//!
//! Records survive restarts via the peers relation of the persistent
//! store. Storage failures are logged and the node keeps running; the
//! in-memory view stays authoritative for the session.

use std::sync::Arc;

use dashmap::DashMap;

use archipel_core::payload::now_millis;
use archipel_core::NodeId;

use crate::store::{Database, TrustRow};

/// Outcome class of a trust check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// First sighting; keys pinned, trusted by default.
    New,
    /// Keys match the pinned material.
    Known,
    /// Keys differ from the pinned material. Alert.
    Mismatch,
}

/// Result of a trust check: the status class and the current trust flag.
#[derive(Debug, Clone, Copy)]
pub struct TrustCheck {
    pub status: TrustStatus,
    pub trusted: bool,
}

#[derive(Clone)]
pub struct TrustStore {
    records: Arc<DashMap<NodeId, TrustRow>>,
    db: Arc<Database>,
}

impl TrustStore {
    /// Build the store, warming the cache from the database.
    pub fn new(db: Arc<Database>) -> Self {
        let records = Arc::new(DashMap::new());
        match db.load_trust() {
            Ok(rows) => {
                for (node_id, row) in rows {
                    records.insert(node_id, row);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load trust records"),
        }
        tracing::debug!(records = records.len(), "trust store loaded");
        Self { records, db }
    }

    /// TOFU check for a sighting of `node_id` with the given key material.
    pub fn check(
        &self,
        node_id: NodeId,
        signing_public: [u8; 32],
        dh_public: [u8; 32],
    ) -> TrustCheck {
        let now = now_millis();

        let Some(mut record) = self.records.get_mut(&node_id) else {
            let row = TrustRow {
                signing_public,
                dh_public,
                first_seen: now,
                last_seen: now,
                trusted: true,
            };
            self.persist(&node_id, &row);
            self.records.insert(node_id, row);
            tracing::info!(peer = %node_id.short(), "pinned first-seen keys");
            return TrustCheck {
                status: TrustStatus::New,
                trusted: true,
            };
        };

        if record.signing_public == signing_public && record.dh_public == dh_public {
            record.last_seen = now;
            self.persist(&node_id, &record);
            return TrustCheck {
                status: TrustStatus::Known,
                trusted: record.trusted,
            };
        }

        // Keys changed under a pinned NodeId. Pin stays; trust is gone
        // until an operator says otherwise.
        record.trusted = false;
        record.last_seen = now;
        self.persist(&node_id, &record);
        tracing::warn!(peer = %node_id.short(), "key mismatch for pinned node id");
        TrustCheck {
            status: TrustStatus::Mismatch,
            trusted: false,
        }
    }

    /// Operator override: re-assert (or revoke) trust for a node.
    /// Returns false when no record exists yet.
    pub fn set_trusted(&self, node_id: &NodeId, trusted: bool) -> bool {
        match self.records.get_mut(node_id) {
            Some(mut record) => {
                record.trusted = trusted;
                self.persist(node_id, &record);
                tracing::info!(peer = %node_id.short(), trusted, "trust re-asserted");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<TrustRow> {
        self.records.get(node_id).map(|r| r.clone())
    }

    /// The pinned signing key, when one exists. Used for mandatory chat
    /// signature verification.
    pub fn signing_key_of(&self, node_id: &NodeId) -> Option<[u8; 32]> {
        self.records.get(node_id).map(|r| r.signing_public)
    }

    fn persist(&self, node_id: &NodeId, row: &TrustRow) {
        if let Err(e) = self.db.upsert_trust(node_id, row) {
            tracing::warn!(peer = %node_id.short(), error = %e, "trust persist failed");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use archipel_core::crypto::hash;

    fn node(tag: &[u8]) -> NodeId {
        NodeId(hash(tag))
    }

    fn store() -> TrustStore {
        TrustStore::new(Arc::new(Database::open_in_memory(16).unwrap()))
    }

    #[test]
    fn first_sighting_pins_and_trusts() {
        let trust = store();
        let check = trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
        assert_eq!(check.status, TrustStatus::New);
        assert!(check.trusted);
    }

    #[test]
    fn matching_keys_stay_known() {
        let trust = store();
        trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
        let check = trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
        assert_eq!(check.status, TrustStatus::Known);
        assert!(check.trusted);
    }

    #[test]
    fn mismatch_clears_trust_and_keeps_pin() {
        let trust = store();
        trust.check(node(b"a"), [1u8; 32], [2u8; 32]);

        let check = trust.check(node(b"a"), [9u8; 32], [2u8; 32]);
        assert_eq!(check.status, TrustStatus::Mismatch);
        assert!(!check.trusted);

        // The original keys stay pinned; even the original material is now
        // reported against a distrusted record.
        assert_eq!(trust.signing_key_of(&node(b"a")), Some([1u8; 32]));
        let again = trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
        assert_eq!(again.status, TrustStatus::Known);
        assert!(!again.trusted);
    }

    #[test]
    fn operator_can_re_assert_trust() {
        let trust = store();
        trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
        trust.check(node(b"a"), [9u8; 32], [2u8; 32]);
        assert!(!trust.check(node(b"a"), [1u8; 32], [2u8; 32]).trusted);

        assert!(trust.set_trusted(&node(b"a"), true));
        assert!(trust.check(node(b"a"), [1u8; 32], [2u8; 32]).trusted);

        assert!(!trust.set_trusted(&node(b"unknown"), true));
    }

    #[test]
    fn records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arch.db");

        {
            let db = Arc::new(Database::open(&path, 16).unwrap());
            let trust = TrustStore::new(db);
            trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
            trust.check(node(b"a"), [9u8; 32], [2u8; 32]); // mismatch
        }

        let db = Arc::new(Database::open(&path, 16).unwrap());
        let trust = TrustStore::new(db);
        // Reloaded record still distrusts, still pins the first keys.
        let check = trust.check(node(b"a"), [1u8; 32], [2u8; 32]);
        assert_eq!(check.status, TrustStatus::Known);
        assert!(!check.trusted);
    }
}
