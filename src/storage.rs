//! Local storage: the device secret store and the public key cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rsa::RsaPublicKey;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use zeroize::Zeroizing;

use crate::types::{ExchangeError, Result};

// ============================================================================
// Secret Store
// ============================================================================

/// Device-local key/value storage for secrets.
///
/// Only `get` and `set` are needed; the core never enumerates entries.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the value stored under `name`.
    async fn get(&self, name: &str) -> Result<Option<Zeroizing<String>>>;

    /// Store `value` under `name`, replacing any previous value.
    async fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// In-memory implementation of SecretStore (for testing).
///
/// WARNING: values are held unencrypted and lost when the process exits.
#[derive(Default, Clone)]
pub struct InMemorySecretStore {
    entries: Arc<RwLock<HashMap<String, Zeroizing<String>>>>,
}

impl InMemorySecretStore {
    /// Creates an empty in-memory secret store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<Zeroizing<String>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(name).cloned())
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(name.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }
}

/// Secret store backed by a single JSON file.
///
/// The file is rewritten through a temporary sibling and renamed into place.
/// On Unix it is created with mode `0600`.
pub struct FileSecretStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    /// Creates a store persisting to `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, String>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(ExchangeError::SecretStore(format!(
                    "Read {} failed: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&contents)
            .map_err(|e| ExchangeError::SecretStore(format!("Corrupt secret file: {}", e)))
    }
}

#[async_trait::async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, name: &str) -> Result<Option<Zeroizing<String>>> {
        let mut entries = self.read_all().await?;
        Ok(entries.remove(name).map(Zeroizing::new))
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.read_all().await?;
        entries.insert(name.to_string(), value.to_string());
        let json = Zeroizing::new(
            serde_json::to_string(&entries)
                .map_err(|e| ExchangeError::SecretStore(format!("Encode failed: {}", e)))?,
        );

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| ExchangeError::SecretStore(format!("Write failed: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| ExchangeError::SecretStore(format!("Chmod failed: {}", e)))?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ExchangeError::SecretStore(format!("Rename failed: {}", e)))?;

        debug!(path = %self.path.display(), slot = name, "secret stored");
        Ok(())
    }
}

// ============================================================================
// Public Key Cache
// ============================================================================

/// A resolved directory key and when it stops being trusted.
struct CachedKey {
    key: RsaPublicKey,
    expires_at: Instant,
}

/// Resolved RSA public keys, keyed by identity, each valid for a fixed TTL.
///
/// Expired entries are never returned and are swept out whenever a new key is stored.
pub struct PublicKeyCache {
    entries: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache the key resolved for `identity`, dropping any expired entries.
    pub async fn store(&self, identity: &str, key: RsaPublicKey) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            identity.to_string(),
            CachedKey {
                key,
                expires_at: now + self.ttl,
            },
        );
    }

    /// The cached key for `identity`, unless it has expired.
    pub async fn retrieve(&self, identity: &str) -> Option<RsaPublicKey> {
        let entries = self.entries.read().await;
        entries
            .get(identity)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.key.clone())
    }

    /// Forget `identity`, e.g. after it republished.
    pub async fn invalidate(&self, identity: &str) {
        self.entries.write().await.remove(identity);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_keys;
    use crate::types::PRIVATE_KEY_SLOT;

    #[tokio::test]
    async fn test_in_memory_secret_store() {
        let store = InMemorySecretStore::new();
        assert!(store.get(PRIVATE_KEY_SLOT).await.unwrap().is_none());

        store.set(PRIVATE_KEY_SLOT, "secret").await.unwrap();
        assert_eq!(store.get(PRIVATE_KEY_SLOT).await.unwrap().unwrap().as_str(), "secret");

        store.set(PRIVATE_KEY_SLOT, "replaced").await.unwrap();
        assert_eq!(store.get(PRIVATE_KEY_SLOT).await.unwrap().unwrap().as_str(), "replaced");
    }

    #[tokio::test]
    async fn test_file_secret_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = FileSecretStore::new(&path);
        assert!(store.get(PRIVATE_KEY_SLOT).await.unwrap().is_none());
        store.set(PRIVATE_KEY_SLOT, "{\"kty\":\"RSA\"}").await.unwrap();
        store.set("other", "value").await.unwrap();

        let reopened = FileSecretStore::new(&path);
        assert_eq!(
            reopened.get(PRIVATE_KEY_SLOT).await.unwrap().unwrap().as_str(),
            "{\"kty\":\"RSA\"}"
        );
        assert_eq!(reopened.get("other").await.unwrap().unwrap().as_str(), "value");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_file_secret_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileSecretStore::new(&path);
        let result = store.get(PRIVATE_KEY_SLOT).await;
        assert!(matches!(result, Err(ExchangeError::SecretStore(_))));
    }

    #[tokio::test]
    async fn test_public_key_cache_expires() {
        let (alice, bob) = test_keys();
        let cache = PublicKeyCache::new(Duration::from_millis(100));

        cache.store("A", alice.public_key().clone()).await;
        assert_eq!(cache.retrieve("A").await.as_ref(), Some(alice.public_key()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.retrieve("A").await.is_none());

        // Storing another key sweeps the expired one.
        cache.store("B", bob.public_key().clone()).await;
        let entries = cache.entries.read().await;
        assert!(!entries.contains_key("A"));
        assert!(entries.contains_key("B"));
    }

    #[tokio::test]
    async fn test_public_key_cache_invalidate() {
        let (alice, _) = test_keys();
        let cache = PublicKeyCache::new(Duration::from_secs(60));

        cache.store("A", alice.public_key().clone()).await;
        cache.invalidate("A").await;
        assert!(cache.retrieve("A").await.is_none());

        cache.store("A", alice.public_key().clone()).await;
        cache.clear().await;
        assert!(cache.retrieve("A").await.is_none());
    }
}
