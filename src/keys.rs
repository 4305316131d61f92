//! Key generation, serialization, and local persistence.
//!
//! Keys are RSA-2048 pairs exchanged as JSON Web Keys (RFC 7517/7518), the
//! same shape WebCrypto produces for `RSA-OAEP-256`. Only the public half is
//! ever published; the private half lives in a [`SecretStore`] slot.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::storage::SecretStore;
use crate::types::{ExchangeError, Result, JWK_ALGORITHM, PRIVATE_KEY_SLOT, RSA_MODULUS_BITS};

const JWK_KEY_TYPE: &str = "RSA";

/// An RSA key pair owned by the local identity.
///
/// The private half is only reachable inside the crate; it is never
/// serialized except through [`export_private`] into the local secret store.
#[derive(Clone)]
pub struct KeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl KeyPair {
    /// Builds a key pair from its private half.
    pub fn from_private(private: RsaPrivateKey) -> Self {
        Self {
            public: private.to_public_key(),
            private,
        }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &fingerprint(&self.public))
            .field("private", &"<redacted>")
            .finish()
    }
}

/// A public key serialized as JWK JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerializedPublicKey(String);

impl SerializedPublicKey {
    /// Wraps JWK JSON received from the directory.
    pub fn new(jwk: impl Into<String>) -> Self {
        Self(jwk.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// A private key serialized as JWK JSON. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SerializedPrivateKey(Zeroizing<String>);

impl SerializedPrivateKey {
    pub fn new(jwk: impl Into<String>) -> Self {
        Self(Zeroizing::new(jwk.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SerializedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializedPrivateKey(<redacted>)")
    }
}

#[derive(Deserialize)]
struct PublicJwk {
    kty: String,
    n: String,
    e: String,
}

#[derive(Serialize, Deserialize)]
struct PrivateJwk {
    kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
    dp: String,
    dq: String,
    qi: String,
}

impl Drop for PrivateJwk {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.d.zeroize();
        self.p.zeroize();
        self.q.zeroize();
        self.dp.zeroize();
        self.dq.zeroize();
        self.qi.zeroize();
    }
}

fn encode_uint(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode_uint(field: &str, value: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| ExchangeError::KeyImport(format!("Field '{}' is not base64url: {}", field, e)))?;
    if bytes.is_empty() {
        return Err(ExchangeError::KeyImport(format!("Field '{}' is empty", field)));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

fn check_key_type(kty: &str) -> Result<()> {
    if kty != JWK_KEY_TYPE {
        return Err(ExchangeError::KeyImport(format!(
            "Unsupported key type: {}",
            kty
        )));
    }
    Ok(())
}

fn check_modulus(bits: usize) -> Result<()> {
    if bits < RSA_MODULUS_BITS {
        return Err(ExchangeError::KeyImport(format!(
            "Modulus too small: {} bits (min {})",
            bits, RSA_MODULUS_BITS
        )));
    }
    Ok(())
}

/// Generate a fresh RSA key pair.
///
/// Prime search is CPU-bound, so it runs on the blocking pool and the caller
/// only awaits its completion.
pub async fn generate_key_pair() -> Result<KeyPair> {
    let private = tokio::task::spawn_blocking(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, RSA_MODULUS_BITS)
    })
    .await
    .map_err(|e| ExchangeError::KeyGeneration(format!("Key generation task failed: {}", e)))?
    .map_err(|e| ExchangeError::KeyGeneration(e.to_string()))?;

    let pair = KeyPair::from_private(private);
    debug!(fingerprint = %fingerprint(pair.public_key()), "generated key pair");
    Ok(pair)
}

/// Serialize the public half of a key pair.
pub fn export_public(pair: &KeyPair) -> SerializedPublicKey {
    export_public_key(pair.public_key())
}

/// Serialize a public key as JWK JSON.
///
/// Output is deterministic: identical keys always produce identical strings.
pub fn export_public_key(key: &RsaPublicKey) -> SerializedPublicKey {
    // Every member is either a constant or base64url, none of which need escaping.
    SerializedPublicKey(format!(
        r#"{{"kty":"{}","alg":"{}","n":"{}","e":"{}"}}"#,
        JWK_KEY_TYPE,
        JWK_ALGORITHM,
        encode_uint(key.n()),
        encode_uint(key.e()),
    ))
}

/// Serialize the private half of a key pair as JWK JSON, including CRT parameters.
pub fn export_private(pair: &KeyPair) -> Result<SerializedPrivateKey> {
    let key = pair.private_key();
    let primes = key.primes();
    if primes.len() != 2 {
        return Err(ExchangeError::KeyImport(format!(
            "Expected two primes, found {}",
            primes.len()
        )));
    }
    let (p, q) = (&primes[0], &primes[1]);
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);

    let dp = key.d() % &(p - &one);
    let dq = key.d() % &(q - &one);
    // p is prime, so q^(p-2) mod p is the inverse of q.
    let qi = q.modpow(&(p - &two), p);

    let jwk = PrivateJwk {
        kty: JWK_KEY_TYPE.to_string(),
        alg: Some(JWK_ALGORITHM.to_string()),
        n: encode_uint(key.n()),
        e: encode_uint(key.e()),
        d: encode_uint(key.d()),
        p: encode_uint(p),
        q: encode_uint(q),
        dp: encode_uint(&dp),
        dq: encode_uint(&dq),
        qi: encode_uint(&qi),
    };
    let json = serde_json::to_string(&jwk)
        .map_err(|e| ExchangeError::KeyImport(format!("Private key encoding failed: {}", e)))?;
    Ok(SerializedPrivateKey::new(json))
}

/// Parse a JWK public key.
pub fn import_public(jwk: &str) -> Result<RsaPublicKey> {
    let jwk: PublicJwk = serde_json::from_str(jwk)
        .map_err(|e| ExchangeError::KeyImport(format!("Malformed public JWK: {}", e)))?;
    check_key_type(&jwk.kty)?;

    let n = decode_uint("n", &jwk.n)?;
    let e = decode_uint("e", &jwk.e)?;
    let key = RsaPublicKey::new(n, e)
        .map_err(|e| ExchangeError::KeyImport(format!("Invalid public key: {}", e)))?;
    check_modulus(key.size() * 8)?;
    Ok(key)
}

/// Parse a JWK private key and check its components are consistent.
pub fn import_private(jwk: &str) -> Result<RsaPrivateKey> {
    let jwk: PrivateJwk = serde_json::from_str(jwk)
        .map_err(|_| ExchangeError::KeyImport("Malformed private JWK".to_string()))?;
    check_key_type(&jwk.kty)?;

    let n = decode_uint("n", &jwk.n)?;
    let e = decode_uint("e", &jwk.e)?;
    let d = decode_uint("d", &jwk.d)?;
    let p = decode_uint("p", &jwk.p)?;
    let q = decode_uint("q", &jwk.q)?;

    let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|e| ExchangeError::KeyImport(format!("Invalid private key: {}", e)))?;
    key.validate()
        .map_err(|e| ExchangeError::KeyImport(format!("Inconsistent private key: {}", e)))?;
    check_modulus(key.size() * 8)?;
    Ok(key)
}

/// Hex SHA-256 of the serialized public key. Safe to log and display.
pub fn fingerprint(key: &RsaPublicKey) -> String {
    let jwk = export_public_key(key);
    hex::encode(Sha256::digest(jwk.as_str().as_bytes()))
}

/// Owns the device-local private key slot.
pub struct KeyManager<S: SecretStore> {
    store: S,
}

impl<S: SecretStore> KeyManager<S> {
    /// Creates a key manager over the given secret store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Write the serialized private key to the secret store, replacing any earlier key.
    pub async fn persist_private(&self, key: &SerializedPrivateKey) -> Result<()> {
        self.store.set(PRIVATE_KEY_SLOT, key.as_str()).await
    }

    /// Read the serialized private key, if this device has ever generated one.
    ///
    /// `None` is the normal "cannot decrypt yet" state, not a failure.
    pub async fn load_private(&self) -> Result<Option<SerializedPrivateKey>> {
        Ok(self
            .store
            .get(PRIVATE_KEY_SLOT)
            .await?
            .map(|jwk| SerializedPrivateKey::new(jwk.as_str())))
    }

    /// Load and import the persisted key pair.
    pub async fn load_key_pair(&self) -> Result<Option<KeyPair>> {
        match self.load_private().await? {
            Some(serialized) => {
                let private = import_private(serialized.as_str())?;
                Ok(Some(KeyPair::from_private(private)))
            }
            None => Ok(None),
        }
    }

    /// Return the persisted key pair, generating and persisting one on first use.
    pub async fn load_or_generate(&self) -> Result<KeyPair> {
        if let Some(pair) = self.load_key_pair().await? {
            debug!(fingerprint = %fingerprint(pair.public_key()), "loaded key pair");
            return Ok(pair);
        }

        let pair = generate_key_pair().await?;
        self.persist_private(&export_private(&pair)?).await?;
        info!(fingerprint = %fingerprint(pair.public_key()), "persisted new key pair");
        Ok(pair)
    }

    /// Returns the underlying secret store.
    pub fn store(&self) -> &S {
        &self.store
    }
}
