//! Datagram sealing with the shared cluster secret.
//!
//! Every packet on the wire is `nonce (12 bytes) || ChaCha20-Poly1305
//! ciphertext`. A node without the secret can neither read traffic nor inject
//! a packet that authenticates, which is the whole membership access control:
//! hold the key, and you may gossip.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::config::KEY_LEN;
use super::types::GossipError;

const NONCE_LEN: usize = 12;

/// Seals and opens gossip datagrams with the cluster secret.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
}

impl Sealer {
    pub fn new(secret_key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(secret_key.into()),
        }
    }

    /// Encrypt a serialized message into a wire packet.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, GossipError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|_| GossipError::Reject("encryption failed"))?;

        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(&nonce_bytes);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Authenticate and decrypt a wire packet back into a serialized message.
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>, GossipError> {
        if packet.len() < NONCE_LEN {
            return Err(GossipError::Reject("packet shorter than nonce"));
        }
        let (nonce_bytes, ciphertext) = packet.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| GossipError::Reject("packet authentication failed"))
    }
}
