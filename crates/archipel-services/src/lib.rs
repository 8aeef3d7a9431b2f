//! archipel-services — the node's shared state services.
//!
//! Peer table, TOFU trust store, persistent store, chunker, local file
//! index, and the event bus. Each shared resource is owned by exactly one
//! of these types; the daemon's I/O tasks interact through their
//! operations and never share raw state.

pub mod chunker;
pub mod events;
pub mod file_index;
pub mod peer;
pub mod store;
pub mod trust;

pub use events::{EventBus, NodeEvent};
pub use file_index::FileIndex;
pub use peer::{PeerInfo, PeerTable};
pub use store::{Database, MessageRecord};
pub use trust::{TrustStatus, TrustStore};
