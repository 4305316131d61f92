//! Type definitions and protocol constants for the messaging core.

use thiserror::Error;

/// RSA modulus size used for every generated key pair.
pub const RSA_MODULUS_BITS: usize = 2048;

/// Size of a SHA-256 digest, the OAEP hash.
pub const OAEP_HASH_SIZE: usize = 32;

/// Largest plaintext that RSA-OAEP(SHA-256) can seal under a 2048-bit key.
///
/// `k - 2 * hLen - 2` with `k = 256` and `hLen = 32`.
pub const OAEP_SHA256_MAX_PLAINTEXT_2048: usize = RSA_MODULUS_BITS / 8 - 2 * OAEP_HASH_SIZE - 2;

/// JWK algorithm name for RSA-OAEP with SHA-256.
pub const JWK_ALGORITHM: &str = "RSA-OAEP-256";

/// Size of a shared AEAD key in bytes.
pub const SHARED_KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Name of the secret store slot holding the serialized private key.
pub const PRIVATE_KEY_SLOT: &str = "privateKeyJwk";

/// Default number of directory matches returned by a fragment search.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Errors that can occur in the messaging core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    // Key errors
    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Serialized key material could not be imported.
    #[error("Key import failed: {0}")]
    KeyImport(String),

    // Cipher errors
    /// Plaintext exceeds what the recipient key can seal.
    #[error("Plaintext too large: {len} bytes (max {max})")]
    PlaintextTooLarge { len: usize, max: usize },

    /// Ciphertext was rejected by the private key (padding or wrong key).
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// AEAD tag did not verify; the ciphertext or nonce was altered, or the key is wrong.
    #[error("Authentication failed: ciphertext or nonce does not verify")]
    AuthenticationFailed,

    /// Input was not valid base64, had the wrong length, or was not UTF-8.
    #[error("Encoding error: {0}")]
    Encoding(String),

    // Directory errors
    /// The directory store could not be reached.
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The recipient has not published a public key.
    #[error("No public key published for: {0}")]
    RecipientKeyNotFound(String),

    // Relay errors
    /// The relay rejected or failed to accept an envelope.
    #[error("Transmission failed: {0}")]
    Transmission(String),

    /// The relay feed dropped the subscription.
    #[error("Subscription disconnected: {0}")]
    SubscriptionDisconnected(String),

    // Local errors
    /// The local secret store failed.
    #[error("Secret store failed: {0}")]
    SecretStore(String),

    /// An operation required an authenticated session.
    #[error("Not signed in")]
    NotSignedIn,

    /// An operation required a selected peer.
    #[error("No peer selected")]
    NoPeerSelected,
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oaep_ceiling() {
        assert_eq!(OAEP_SHA256_MAX_PLAINTEXT_2048, 190);
    }

    #[test]
    fn test_error_display() {
        let err = ExchangeError::PlaintextTooLarge { len: 191, max: 190 };
        assert_eq!(err.to_string(), "Plaintext too large: 191 bytes (max 190)");
        assert_ne!(
            ExchangeError::AuthenticationFailed,
            ExchangeError::Decryption("bad padding".into())
        );
    }
}
