//! archipeld — the Archipel peer-to-peer node runtime.
//!
//! One task per socket plus timer tasks, all sharing a single injected
//! [`node::NodeState`]. The session transport demultiplexes frames into
//! the handshake, messaging, and transfer handlers; discovery feeds the
//! peer table; the peer table supplies addresses back to the transport.

pub mod discovery;
pub mod messaging;
pub mod node;
pub mod session;
pub mod transfer;

pub use node::{Node, NodeState};
