//! Persistent store: one embedded SQLite database per node.
//!
//! Three wire-facing relations (messages, peers, relay_queue) plus a
//! manifests relation for remote manifests. Every call is atomic on its
//! own; atomicity across calls is not provided and nothing here needs it.
//! The relay fetch-and-delete is a single transaction, which is what
//! gives relay envelopes their single-delivery-attempt contract.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use archipel_core::manifest::Manifest;
use archipel_core::payload::{now_millis, RelayPayload};
use archipel_core::NodeId;

/// Bump when making schema changes; migrations are applied in order.
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Size of the in-memory history mirror kept for UI-style reads.
const RECENT_MESSAGES_CAP: usize = 256;

/// One row of the message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// The conversation this belongs to (the remote peer).
    pub peer_id: NodeId,
    /// Who authored the message.
    pub sender: NodeId,
    pub content: String,
    pub timestamp: u64,
    pub encrypted: bool,
}

/// A peer's pinned trust row, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRow {
    pub signing_public: [u8; 32],
    pub dh_public: [u8; 32],
    pub first_seen: u64,
    pub last_seen: u64,
    pub trusted: bool,
}

pub struct Database {
    conn: Mutex<Connection>,
    recent: Mutex<VecDeque<MessageRecord>>,
    relay_per_sender_cap: u32,
}

impl Database {
    /// Open (creating if necessary) the database at `path`.
    pub fn open(path: &Path, relay_per_sender_cap: u32) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, relay_per_sender_cap)
    }

    /// An in-memory database, used by tests.
    pub fn open_in_memory(relay_per_sender_cap: u32) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, relay_per_sender_cap)
    }

    fn init(conn: Connection, relay_per_sender_cap: u32) -> Result<Self, StoreError> {
        // journal_mode returns the resulting mode as a row, so read it.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

             CREATE TABLE IF NOT EXISTS messages (
                 id        INTEGER PRIMARY KEY AUTOINCREMENT,
                 peer_id   TEXT    NOT NULL,
                 sender    TEXT    NOT NULL,
                 content   TEXT    NOT NULL,
                 timestamp INTEGER NOT NULL,
                 encrypted INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages(peer_id, id);

             CREATE TABLE IF NOT EXISTS peers (
                 node_id     TEXT PRIMARY KEY,
                 dh_pub      TEXT    NOT NULL,
                 signing_pub TEXT    NOT NULL,
                 first_seen  INTEGER NOT NULL,
                 last_seen   INTEGER NOT NULL,
                 trusted     INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS relay_queue (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 target_id  TEXT    NOT NULL,
                 sender_id  TEXT    NOT NULL,
                 content    TEXT    NOT NULL,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_relay_target ON relay_queue(target_id, id);

             CREATE TABLE IF NOT EXISTS manifests (
                 file_id  TEXT PRIMARY KEY,
                 owner_id TEXT NOT NULL,
                 manifest TEXT NOT NULL
             );",
        )?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![CURRENT_SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_MESSAGES_CAP)),
            relay_per_sender_cap,
        })
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Append one message to the history log and the in-memory mirror.
    pub fn append_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().expect("store mutex poisoned");
            conn.execute(
                "INSERT INTO messages (peer_id, sender, content, timestamp, encrypted)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.peer_id.to_string(),
                    record.sender.to_string(),
                    record.content,
                    record.timestamp,
                    record.encrypted as i64,
                ],
            )?;
        }

        let mut recent = self.recent.lock().expect("store mutex poisoned");
        if recent.len() == RECENT_MESSAGES_CAP {
            recent.pop_front();
        }
        recent.push_back(record.clone());
        Ok(())
    }

    /// Most recent `limit` messages exchanged with `peer_id`, oldest first.
    pub fn history(&self, peer_id: &NodeId, limit: u32) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT peer_id, sender, content, timestamp, encrypted
             FROM (SELECT * FROM messages WHERE peer_id = ?1 ORDER BY id DESC LIMIT ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![peer_id.to_string(), limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (peer, sender, content, timestamp, encrypted) = row?;
            out.push(MessageRecord {
                peer_id: peer.parse().map_err(|_| StoreError::Corrupt("peer_id"))?,
                sender: sender.parse().map_err(|_| StoreError::Corrupt("sender"))?,
                content,
                timestamp,
                encrypted: encrypted != 0,
            });
        }
        Ok(out)
    }

    /// The bounded in-memory mirror of recent messages.
    pub fn recent_messages(&self) -> Vec<MessageRecord> {
        self.recent
            .lock()
            .expect("store mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    // ── Trust rows ────────────────────────────────────────────────────────────

    pub fn upsert_trust(&self, node_id: &NodeId, row: &TrustRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO peers (node_id, dh_pub, signing_pub, first_seen, last_seen, trusted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(node_id) DO UPDATE SET
                 dh_pub = excluded.dh_pub,
                 signing_pub = excluded.signing_pub,
                 last_seen = excluded.last_seen,
                 trusted = excluded.trusted",
            params![
                node_id.to_string(),
                hex::encode(row.dh_public),
                hex::encode(row.signing_public),
                row.first_seen,
                row.last_seen,
                row.trusted as i64,
            ],
        )?;
        Ok(())
    }

    pub fn load_trust(&self) -> Result<Vec<(NodeId, TrustRow)>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT node_id, dh_pub, signing_pub, first_seen, last_seen, trusted FROM peers",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, u64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (node_id, dh_pub, signing_pub, first_seen, last_seen, trusted) = row?;
            out.push((
                node_id.parse().map_err(|_| StoreError::Corrupt("node_id"))?,
                TrustRow {
                    signing_public: decode32(&signing_pub)?,
                    dh_public: decode32(&dh_pub)?,
                    first_seen,
                    last_seen,
                    trusted: trusted != 0,
                },
            ));
        }
        Ok(out)
    }

    // ── Relay queue ───────────────────────────────────────────────────────────

    /// Enqueue a relay envelope. Returns false (without storing) when the
    /// originating sender already has its full quota queued here; the cap
    /// is what keeps a chatty peer from filling our disk.
    pub fn relay_enqueue(
        &self,
        envelope: &RelayPayload,
        expires_at: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;

        let queued: u32 = tx.query_row(
            "SELECT COUNT(*) FROM relay_queue WHERE sender_id = ?1 AND expires_at > ?2",
            params![envelope.sender.to_string(), now_millis()],
            |row| row.get(0),
        )?;
        if queued >= self.relay_per_sender_cap {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO relay_queue (target_id, sender_id, content, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                envelope.target.to_string(),
                envelope.sender.to_string(),
                envelope.content,
                envelope.timestamp,
                expires_at,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Return and delete every non-expired envelope queued for `target`,
    /// FIFO. Expired rows are purged on the way. One transaction: a
    /// fetched envelope is gone from the queue before the caller sees it.
    pub fn relay_fetch(&self, target: &NodeId) -> Result<Vec<RelayPayload>, StoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let now = now_millis();

        tx.execute("DELETE FROM relay_queue WHERE expires_at <= ?1", params![now])?;

        let mut out = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT sender_id, content, created_at FROM relay_queue
                 WHERE target_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![target.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })?;
            for row in rows {
                let (sender, content, created_at) = row?;
                out.push(RelayPayload {
                    target: *target,
                    sender: sender.parse().map_err(|_| StoreError::Corrupt("sender_id"))?,
                    content,
                    timestamp: created_at,
                });
            }
        }

        tx.execute(
            "DELETE FROM relay_queue WHERE target_id = ?1",
            params![target.to_string()],
        )?;
        tx.commit()?;
        Ok(out)
    }

    /// Count of queued envelopes for a target (diagnostics and tests).
    pub fn relay_len(&self, target: &NodeId) -> Result<u32, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM relay_queue WHERE target_id = ?1 AND expires_at > ?2",
            params![target.to_string(), now_millis()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Manifests ─────────────────────────────────────────────────────────────

    /// Persist a manifest received from `owner`.
    pub fn save_remote_manifest(
        &self,
        owner: &NodeId,
        manifest: &Manifest,
    ) -> Result<(), StoreError> {
        let text = serde_json::to_string(manifest).map_err(|_| StoreError::Corrupt("manifest"))?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO manifests (file_id, owner_id, manifest) VALUES (?1, ?2, ?3)
             ON CONFLICT(file_id) DO UPDATE SET owner_id = excluded.owner_id,
                                                manifest = excluded.manifest",
            params![manifest.file_id, owner.to_string(), text],
        )?;
        Ok(())
    }

    pub fn remote_manifest(&self, file_id: &str) -> Result<Option<(NodeId, Manifest)>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT owner_id, manifest FROM manifests WHERE file_id = ?1",
                params![file_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((owner, text)) => {
                let owner = owner.parse().map_err(|_| StoreError::Corrupt("owner_id"))?;
                let manifest =
                    serde_json::from_str(&text).map_err(|_| StoreError::Corrupt("manifest"))?;
                Ok(Some((owner, manifest)))
            }
        }
    }
}

fn decode32(hex_str: &str) -> Result<[u8; 32], StoreError> {
    hex::decode(hex_str)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(StoreError::Corrupt("key column"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(std::io::Error),

    #[error("corrupt column: {0}")]
    Corrupt(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
