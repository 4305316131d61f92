//! Message encryption and decryption.
//!
//! Two envelope variants are supported:
//!
//! * **Per-recipient** (primary): RSA-OAEP with SHA-256 against the
//!   recipient's public key. A plaintext can be at most
//!   [`max_plaintext_len`] bytes, which is 190 for a 2048-bit key.
//! * **Shared key**: ChaCha20-Poly1305 with a fresh random 96-bit nonce per
//!   message. The key must come from an out-of-band agreement; there is no
//!   built-in default key.
//!
//! Ciphertext and nonces travel as standard base64.

use std::collections::HashMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{ExchangeError, Result, NONCE_SIZE, OAEP_HASH_SIZE, SHARED_KEY_SIZE, TAG_SIZE};

/// Largest plaintext, in bytes, that can be sealed to `key`.
pub fn max_plaintext_len(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(2 * OAEP_HASH_SIZE + 2)
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| ExchangeError::Encoding(format!("{} is not base64: {}", field, e)))
}

fn into_text(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| ExchangeError::Encoding(format!("Plaintext is not UTF-8: {}", e)))
}

/// Encrypt text for the holder of `recipient_key`.
///
/// # Returns
/// Base64 ciphertext exactly one modulus long.
pub fn encrypt_for_recipient(plaintext: &str, recipient_key: &RsaPublicKey) -> Result<String> {
    let message_bytes = plaintext.as_bytes();
    let max = max_plaintext_len(recipient_key);

    if message_bytes.len() > max {
        return Err(ExchangeError::PlaintextTooLarge {
            len: message_bytes.len(),
            max,
        });
    }

    let mut rng = rand::thread_rng();
    let ciphertext = recipient_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), message_bytes)
        .map_err(|e| ExchangeError::Encoding(format!("OAEP encryption failed: {}", e)))?;

    Ok(STANDARD.encode(ciphertext))
}

/// Decrypt base64 ciphertext that was sealed to our own public key.
pub fn decrypt_with_own_key(ciphertext: &str, own_key: &RsaPrivateKey) -> Result<String> {
    let bytes = decode_base64("ciphertext", ciphertext)?;

    if bytes.len() != own_key.size() {
        return Err(ExchangeError::Encoding(format!(
            "Ciphertext length {} does not match modulus length {}",
            bytes.len(),
            own_key.size()
        )));
    }

    let plaintext = own_key
        .decrypt(Oaep::new::<Sha256>(), &bytes)
        .map_err(|e| ExchangeError::Decryption(e.to_string()))?;

    into_text(plaintext)
}

/// A 256-bit key for the shared-key variant. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_SIZE]);

impl SharedKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; SHARED_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap raw key bytes from an external agreement step.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SHARED_KEY_SIZE] = bytes.try_into().map_err(|_| {
            ExchangeError::KeyImport(format!(
                "Shared key must be {} bytes, got {}",
                SHARED_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Shared keys held for this session, one per peer identity.
#[derive(Debug, Clone, Default)]
pub struct SharedKeyring {
    keys: HashMap<String, SharedKey>,
}

impl SharedKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the key agreed with `peer`, replacing any earlier one.
    pub fn insert(&mut self, peer: impl Into<String>, key: SharedKey) {
        self.keys.insert(peer.into(), key);
    }

    pub fn get(&self, peer: &str) -> Option<&SharedKey> {
        self.keys.get(peer)
    }

    pub fn remove(&mut self, peer: &str) -> Option<SharedKey> {
        self.keys.remove(peer)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Output of the shared-key variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedText {
    /// Base64 ciphertext with the 16-byte tag appended.
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub nonce: String,
}

/// Encrypt text under a shared key with a fresh random nonce.
pub fn encrypt_with_shared_key(plaintext: &str, key: &SharedKey) -> Result<SealedText> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| ExchangeError::Encoding(format!("AEAD encryption failed: {}", e)))?;

    Ok(SealedText {
        ciphertext: STANDARD.encode(ciphertext),
        nonce: STANDARD.encode(nonce_bytes),
    })
}

/// Decrypt text sealed under a shared key.
///
/// A tag mismatch is reported as [`ExchangeError::AuthenticationFailed`], never
/// as an encoding error.
pub fn decrypt_with_shared_key(ciphertext: &str, nonce: &str, key: &SharedKey) -> Result<String> {
    let nonce_bytes = decode_base64("nonce", nonce)?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(ExchangeError::Encoding(format!(
            "Nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let bytes = decode_base64("ciphertext", ciphertext)?;
    if bytes.len() < TAG_SIZE {
        return Err(ExchangeError::Encoding(format!(
            "Ciphertext too short: {} bytes (minimum {})",
            bytes.len(),
            TAG_SIZE
        )));
    }

    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(&nonce_bytes), bytes.as_slice())
        .map_err(|_| ExchangeError::AuthenticationFailed)?;

    into_text(plaintext)
}
