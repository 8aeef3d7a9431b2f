//! Messaging: signed chat with AEAD after a handshake, relay fallback
//! before one or when the wire is down.
//!
//! Every outgoing message is signed with the long-term key. When a
//! session key exists the plaintext travels AEAD-sealed with a fresh
//! nonce; until then it travels in the clear with a null nonce. A
//! transport failure turns the send into a relay enqueue plus a fan-out
//! of RELAY frames to whoever is reachable right now.

use std::sync::Arc;

use anyhow::{Context, Result};

use archipel_core::crypto::{self, aead_open, aead_seal};
use archipel_core::frame::FrameType;
use archipel_core::payload::{
    decode_sig64, now_millis, ChatPayload, RelayPayload,
};
use archipel_core::NodeId;
use archipel_services::{MessageRecord, NodeEvent};

use crate::node::NodeState;
use crate::session;

/// Two-valued outcome of a send, shaped for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// The payload travelled under a session key.
    pub encrypted: bool,
    /// Direct delivery failed; the message went to the relay fabric.
    pub relayed: bool,
}

/// Send `text` to `target`, falling back to relay mode when the
/// transport cannot reach them.
pub async fn send(state: &Arc<NodeState>, target: NodeId, text: &str) -> Result<SendOutcome> {
    let session_key = state.peers.session_key(&target);

    let (ciphertext, nonce) = match session_key {
        Some(key) => {
            let (nonce, sealed) = aead_seal(&key, text.as_bytes()).context("message seal")?;
            (hex::encode(sealed), Some(hex::encode(nonce)))
        }
        None => (text.to_string(), None),
    };

    let chat = ChatPayload {
        ciphertext,
        nonce,
        signature: hex::encode(state.identity.signing().sign(text.as_bytes())),
        node_id: state.node_id(),
        timestamp: now_millis(),
    };
    let body = serde_json::to_vec(&chat).context("chat encode")?;

    match session::send_frame(state, target, FrameType::Msg, &body).await {
        Ok(()) => {
            let encrypted = session_key.is_some();
            record_history(state, target, state.node_id(), text, encrypted);
            Ok(SendOutcome {
                encrypted,
                relayed: false,
            })
        }
        Err(e) => {
            tracing::info!(
                peer = %target.short(),
                error = %e,
                "direct send failed, entering relay mode"
            );
            relay_fallback(state, target, text).await;
            record_history(state, target, state.node_id(), text, false);
            Ok(SendOutcome {
                encrypted: false,
                relayed: true,
            })
        }
    }
}

/// Send `text` to every active peer. Returns each peer's outcome.
pub async fn broadcast(state: &Arc<NodeState>, text: &str) -> Vec<(NodeId, SendOutcome)> {
    let mut outcomes = Vec::new();
    for peer in state.peers.get_active() {
        match send(state, peer.node_id, text).await {
            Ok(outcome) => outcomes.push((peer.node_id, outcome)),
            Err(e) => tracing::warn!(peer = %peer.node_id.short(), error = %e, "broadcast leg failed"),
        }
    }
    outcomes
}

/// Queue the message locally and hand copies to every reachable peer,
/// who agree to carry them (§ relay dispatch). Best effort throughout.
async fn relay_fallback(state: &Arc<NodeState>, target: NodeId, text: &str) {
    let envelope = RelayPayload {
        target,
        sender: state.node_id(),
        content: text.to_string(),
        timestamp: now_millis(),
    };

    match state.db.relay_enqueue(&envelope, state.relay_expiry()) {
        Ok(true) => {}
        Ok(false) => tracing::warn!("own relay queue at cap, envelope not queued locally"),
        Err(e) => tracing::warn!(error = %e, "relay enqueue failed"),
    }

    let Ok(body) = serde_json::to_vec(&envelope) else {
        return;
    };
    for peer in state.peers.get_active() {
        if peer.node_id == target {
            continue;
        }
        if let Err(e) =
            session::send_frame(state, peer.node_id, FrameType::Relay, &body).await
        {
            tracing::debug!(carrier = %peer.node_id.short(), error = %e, "relay hand-off failed");
        }
    }
}

/// Deliver an incoming chat body from `sender`.
///
/// AEAD failures drop the message (there is no plaintext to show) but
/// never the connection. A bad or undecodable signature taints the text
/// and it is delivered anyway, marked.
pub fn handle_chat(state: &Arc<NodeState>, sender: NodeId, chat: ChatPayload) {
    let encrypted = chat.nonce.is_some();

    let text = match &chat.nonce {
        Some(nonce_hex) => {
            let Some(key) = state.peers.session_key(&sender) else {
                tracing::warn!(peer = %sender.short(), "encrypted chat without a session key");
                return;
            };
            let (Ok(sealed), Some(nonce)) = (
                hex::decode(&chat.ciphertext),
                hex::decode(nonce_hex).ok().and_then(|n| <[u8; 12]>::try_from(n).ok()),
            ) else {
                tracing::warn!(peer = %sender.short(), "chat with undecodable ciphertext");
                return;
            };
            match aead_open(&key, &nonce, &sealed) {
                Some(plaintext) => match String::from_utf8(plaintext) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(peer = %sender.short(), "decrypted chat is not UTF-8");
                        return;
                    }
                },
                None => {
                    tracing::warn!(peer = %sender.short(), "AEAD tag failure, message dropped");
                    return;
                }
            }
        }
        None => chat.ciphertext.clone(),
    };

    // Signature verification is mandatory whenever we know the key.
    let known_key = state
        .trust
        .signing_key_of(&sender)
        .or_else(|| state.peers.get(&sender).map(|p| p.signing_public));
    let tainted = match known_key {
        Some(key) => match decode_sig64(&chat.signature) {
            Some(sig) => !crypto::verify_signature(&key, text.as_bytes(), &sig),
            None => true,
        },
        None => false,
    };
    if tainted {
        tracing::warn!(peer = %sender.short(), "chat signature invalid, delivering tainted");
    }

    record_history(state, sender, sender, &text, encrypted);
    state.events.emit(NodeEvent::MessageReceived {
        from: sender,
        message: text,
        encrypted,
        tainted,
    });
}

/// Deliver a relay envelope addressed to us.
pub fn deliver_relayed(state: &Arc<NodeState>, envelope: &RelayPayload) {
    tracing::info!(
        origin = %envelope.sender.short(),
        "relayed message delivered"
    );
    record_history(state, envelope.sender, envelope.sender, &envelope.content, false);
    state.events.emit(NodeEvent::MessageReceived {
        from: envelope.sender,
        message: envelope.content.clone(),
        encrypted: false,
        tainted: false,
    });
}

fn record_history(state: &Arc<NodeState>, peer: NodeId, author: NodeId, text: &str, encrypted: bool) {
    let record = MessageRecord {
        peer_id: peer,
        sender: author,
        content: text.to_string(),
        timestamp: now_millis(),
        encrypted,
    };
    if let Err(e) = state.db.append_message(&record) {
        tracing::warn!(error = %e, "history append failed");
    }
}
