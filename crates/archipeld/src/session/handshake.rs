//! Two-leg authenticated key agreement.
//!
//! INIT and RESP are MSG frames under the published MAC key, each
//! carrying the sender's static keys and a fresh ephemeral X25519 public
//! key. Both sides mix two DH outputs:
//!
//!   dh1 = DH(own ephemeral, peer ephemeral)
//!   dh2 = DH(own static,    peer static)
//!   session_key = SHA-256(dh1 || dh2)
//!
//! The responder installs the key the moment it accepts INIT; the
//! initiator installs on receiving RESP, delivered through a oneshot
//! keyed by NodeId. An initiator that hears nothing for five seconds
//! gives up and the messaging layer stays on plaintext delivery.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::time::timeout;

use archipel_core::crypto::{derive_session_key, DhKeypair};
use archipel_core::frame::{self, FrameType, PUBLISHED_MAC_KEY};
use archipel_core::payload::{
    decode_key32, now_millis, HandshakePayload, HANDSHAKE_INIT, HANDSHAKE_RESP,
};
use archipel_core::NodeId;
use archipel_services::peer::PeerInfo;

use crate::node::NodeState;
use crate::session;

/// How long the initiator waits for a HANDSHAKE_RESP.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a handshake toward `target` as initiator.
///
/// Returns true when a session key was established, false on the
/// response timeout (callers fall back to unencrypted delivery). A
/// transport failure is an error: there is no one to shake hands with.
pub async fn initiate(state: &Arc<NodeState>, target: NodeId) -> Result<bool> {
    let ephemeral = DhKeypair::generate();

    let init = HandshakePayload {
        kind: HANDSHAKE_INIT.into(),
        node_id: state.node_id(),
        signing_pub: hex::encode(state.identity.signing().public()),
        dh_pub: hex::encode(state.identity.dh().public()),
        ephemeral_dh_pub: hex::encode(ephemeral.public()),
        timestamp: now_millis(),
    };
    let body = serde_json::to_vec(&init).context("handshake init encode")?;
    let bytes = frame::build(FrameType::Msg, state.node_id(), &body, PUBLISHED_MAC_KEY);

    // Register the waiter before sending; the response can beat us back.
    let (tx, rx) = oneshot::channel();
    state.pending_handshakes.insert(target, tx);

    if let Err(e) = session::send_to(state, target, bytes).await {
        state.pending_handshakes.remove(&target);
        return Err(e);
    }

    let response = match timeout(RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(response)) => response,
        _ => {
            // Timed out or the dispatcher dropped the slot. Back to NONE.
            state.pending_handshakes.remove(&target);
            tracing::debug!(peer = %target.short(), "handshake timed out, staying unencrypted");
            return Ok(false);
        }
    };

    let (Some(peer_static), Some(peer_ephemeral)) = (
        decode_key32(&response.dh_pub),
        decode_key32(&response.ephemeral_dh_pub),
    ) else {
        anyhow::bail!("handshake response carries undecodable keys");
    };

    let dh1 = ephemeral.diffie_hellman(&peer_ephemeral);
    let dh2 = state.identity.dh().diffie_hellman(&peer_static);
    let key = derive_session_key(&dh1, &dh2);

    if !state.peers.set_session_key(&target, key) {
        anyhow::bail!("peer {} vanished during handshake", target.short());
    }
    tracing::info!(peer = %target.short(), "session established (initiator)");
    Ok(true)
}

/// Accept an INIT as responder: derive and install the session key, and
/// return the framed RESP to send back. The caller has already passed
/// the trust gate.
pub fn respond(
    state: &Arc<NodeState>,
    init: &HandshakePayload,
    remote_ip: IpAddr,
) -> Result<Vec<u8>> {
    let (Some(peer_signing), Some(peer_static), Some(peer_ephemeral)) = (
        decode_key32(&init.signing_pub),
        decode_key32(&init.dh_pub),
        decode_key32(&init.ephemeral_dh_pub),
    ) else {
        anyhow::bail!("handshake init carries undecodable keys");
    };

    // An INIT can arrive before any HELLO (manual bootstrap). Make sure
    // the table has an entry to hang the session key on; the port stays
    // unknown until their HELLO, which is fine while the socket is open.
    if !state.peers.contains(&init.node_id) {
        state.peers.upsert(PeerInfo::new(
            init.node_id,
            remote_ip,
            0,
            peer_signing,
            peer_static,
            vec![],
        ));
    }

    let ephemeral = DhKeypair::generate();
    let dh1 = ephemeral.diffie_hellman(&peer_ephemeral);
    let dh2 = state.identity.dh().diffie_hellman(&peer_static);
    let key = derive_session_key(&dh1, &dh2);

    if !state.peers.set_session_key(&init.node_id, key) {
        anyhow::bail!("peer {} vanished during handshake", init.node_id.short());
    }

    let response = HandshakePayload {
        kind: HANDSHAKE_RESP.into(),
        node_id: state.node_id(),
        signing_pub: hex::encode(state.identity.signing().public()),
        dh_pub: hex::encode(state.identity.dh().public()),
        ephemeral_dh_pub: hex::encode(ephemeral.public()),
        timestamp: now_millis(),
    };
    let body = serde_json::to_vec(&response).context("handshake resp encode")?;

    tracing::info!(peer = %init.node_id.short(), "session established (responder)");
    Ok(frame::build(
        FrameType::Msg,
        state.node_id(),
        &body,
        PUBLISHED_MAC_KEY,
    ))
}
