//! Cryptographic primitives for Archipel.
//!
//! Provides four things:
//!   1. SHA-256 hashing: content hashes, chunk hashes, NodeId derivation
//!   2. Ed25519 signatures: identity assertions on chat messages
//!   3. X25519 Diffie-Hellman: the two-leg session key agreement
//!   4. ChaCha20-Poly1305 AEAD: chat payload encryption under session keys
//!
//! Private key material is zeroized on drop. There is no unsafe code in
//! this module.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// AEAD nonce length in bytes. Random per encryption, carried beside the
/// ciphertext on the wire.
pub const AEAD_NONCE_LEN: usize = 12;

/// Poly1305 tag length appended to every ciphertext.
pub const AEAD_TAG_LEN: usize = 16;

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte SHA-256 digest.
///
/// Used for NodeId derivation, chunk and whole-file hashes, file IDs,
/// and session key derivation.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Incremental SHA-256 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use archipel_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// assert_eq!(h.finalize(), archipel_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        let digest = self.0.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Signing keypair ───────────────────────────────────────────────────────────

/// A node's long-term Ed25519 signing keypair.
///
/// Generated once per node and stored with the identity. The public key
/// appears in every HELLO and handshake payload; the NodeId is its hash.
pub struct SigningKeypair {
    key: ed25519_dalek::SigningKey,
}

impl SigningKeypair {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Self {
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private: [u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&private),
        }
    }

    /// The 32-byte public verifying key.
    pub fn public(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes())
    }

    /// Sign an arbitrary byte string, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature against a public key.
///
/// Returns false for malformed keys as well as invalid signatures; the
/// caller only ever cares whether the assertion holds.
pub fn verify_signature(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(public) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    key.verify(message, &sig).is_ok()
}

// ── DH keypair ────────────────────────────────────────────────────────────────

/// An X25519 key-agreement keypair.
///
/// The identity holds a static one; the handshake additionally generates
/// an ephemeral one per leg. The underlying secret zeroizes on drop.
pub struct DhKeypair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl DhKeypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public: *public.as_bytes(),
        }
    }

    /// The 32-byte public key.
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Perform a DH operation against a peer public key, yielding a
    /// 32-byte shared secret.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        *self.secret.diffie_hellman(&peer).as_bytes()
    }
}

/// Derive a session key from the two DH outputs of the handshake.
///
///   session_key = SHA-256(dh_ephemeral || dh_static)
///
/// Both sides compute the same two secrets, so both derive the same key.
pub fn derive_session_key(dh_ephemeral: &[u8; 32], dh_static: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(dh_ephemeral);
    combined[32..].copy_from_slice(dh_static);
    hash(&combined)
}

// ── AEAD ──────────────────────────────────────────────────────────────────────

/// Encrypt plaintext under a 32-byte session key.
///
/// Returns the random 12-byte nonce and the ciphertext with the 16-byte
/// Poly1305 tag appended.
pub fn aead_seal(
    key: &[u8; 32],
    plaintext: &[u8],
) -> Result<([u8; AEAD_NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AeadSeal)?;
    Ok((nonce, ciphertext))
}

/// Decrypt a ciphertext produced by [`aead_seal`].
///
/// Returns None when the tag does not verify; the caller logs and keeps
/// the connection open.
pub fn aead_open(key: &[u8; 32], nonce: &[u8; AEAD_NONCE_LEN], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadSeal,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"archipel"), hash(b"archipel"));
        assert_ne!(hash(b"archipel"), hash(b"Archipel"));
    }

    #[test]
    fn hash_known_vector() {
        // SHA-256 of the empty input
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(hash(b"").as_slice(), expected.as_slice());
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), hash(b"hello world"));
    }

    #[test]
    fn signing_roundtrip_via_private_bytes() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::from_private(*kp1.private_bytes());
        assert_eq!(kp1.public(), kp2.public());
    }

    #[test]
    fn sign_and_verify() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"attest this");
        assert!(verify_signature(&kp.public(), b"attest this", &sig));
        assert!(!verify_signature(&kp.public(), b"something else", &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let sig = kp.sign(b"attest this");
        assert!(!verify_signature(&other.public(), b"attest this", &sig));
    }

    #[test]
    fn dh_shared_secret_agrees() {
        let a = DhKeypair::generate();
        let b = DhKeypair::generate();
        assert_eq!(a.diffie_hellman(&b.public()), b.diffie_hellman(&a.public()));
    }

    #[test]
    fn session_key_derivation_is_symmetric() {
        let eph_a = DhKeypair::generate();
        let eph_b = DhKeypair::generate();
        let stat_a = DhKeypair::generate();
        let stat_b = DhKeypair::generate();

        let key_a = derive_session_key(
            &eph_a.diffie_hellman(&eph_b.public()),
            &stat_a.diffie_hellman(&stat_b.public()),
        );
        let key_b = derive_session_key(
            &eph_b.diffie_hellman(&eph_a.public()),
            &stat_b.diffie_hellman(&stat_a.public()),
        );
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn aead_roundtrip() {
        let key = hash(b"test key material");
        let (nonce, ciphertext) = aead_seal(&key, b"secret text").unwrap();
        assert_eq!(ciphertext.len(), b"secret text".len() + AEAD_TAG_LEN);
        let plaintext = aead_open(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"secret text");
    }

    #[test]
    fn aead_tampered_ciphertext_is_rejected() {
        let key = hash(b"test key material");
        let (nonce, mut ciphertext) = aead_seal(&key, b"important data").unwrap();
        ciphertext[3] ^= 0xff;
        assert!(aead_open(&key, &nonce, &ciphertext).is_none());
    }

    #[test]
    fn aead_wrong_key_is_rejected() {
        let key = hash(b"right key");
        let wrong = hash(b"wrong key");
        let (nonce, ciphertext) = aead_seal(&key, b"payload").unwrap();
        assert!(aead_open(&wrong, &nonce, &ciphertext).is_none());
    }
}
