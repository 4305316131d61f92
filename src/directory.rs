//! Public key directory client.
//!
//! Publishes the local identity's public key and resolves peers' keys. The
//! directory is treated as immediately consistent: a `publish` is visible to
//! every later `resolve`.

use std::time::Duration;

use rsa::RsaPublicKey;
use tracing::{debug, info};

use crate::keys::{fingerprint, import_public, SerializedPublicKey};
use crate::relay::{DirectoryEntry, DirectoryStore};
use crate::storage::PublicKeyCache;
use crate::types::{Result, DEFAULT_SEARCH_LIMIT};

/// Configuration for directory lookups.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Maximum number of matches returned by a fragment search.
    pub search_limit: usize,
    /// Whether resolved public keys are cached.
    pub cache_public_keys: bool,
    /// How long a resolved key stays cached.
    pub key_cache_ttl: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            search_limit: DEFAULT_SEARCH_LIMIT,
            cache_public_keys: true,
            key_cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Client for the shared public key directory.
pub struct DirectoryClient<D: DirectoryStore> {
    store: D,
    config: DirectoryConfig,
    key_cache: PublicKeyCache,
}

impl<D: DirectoryStore> DirectoryClient<D> {
    /// Creates a directory client over the given store.
    pub fn new(store: D, config: DirectoryConfig) -> Self {
        let key_cache = PublicKeyCache::new(config.key_cache_ttl);
        Self {
            store,
            config,
            key_cache,
        }
    }

    /// Publish (or republish) the public key for `identity`.
    ///
    /// The key is parsed before upload so a malformed key is never published.
    pub async fn publish(
        &self,
        identity: &str,
        username: &str,
        public_key: &SerializedPublicKey,
    ) -> Result<()> {
        let parsed = import_public(public_key.as_str())?;

        self.store
            .upsert(DirectoryEntry {
                identity: identity.to_string(),
                username: username.to_string(),
                public_key: public_key.as_str().to_string(),
            })
            .await?;
        self.key_cache.invalidate(identity).await;

        info!(identity, fingerprint = %fingerprint(&parsed), "published public key");
        Ok(())
    }

    /// Interactive search by username fragment on behalf of `requester`.
    ///
    /// The requester's own entry is left out. An empty fragment or no match
    /// yields an empty list.
    pub async fn resolve(&self, requester: &str, fragment: &str) -> Result<Vec<DirectoryEntry>> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = self
            .store
            .search_username(fragment, self.config.search_limit + 1)
            .await?;
        entries.retain(|entry| entry.identity != requester);
        entries.truncate(self.config.search_limit);

        debug!(fragment, matches = entries.len(), "directory search");
        Ok(entries)
    }

    /// Exact lookup by identity.
    pub async fn resolve_exact(&self, identity: &str) -> Result<Option<DirectoryEntry>> {
        self.store.get(identity).await
    }

    /// Exact lookup followed by key import, through the key cache.
    pub async fn resolve_key(&self, identity: &str) -> Result<Option<RsaPublicKey>> {
        if self.config.cache_public_keys {
            if let Some(key) = self.key_cache.retrieve(identity).await {
                return Ok(Some(key));
            }
        }

        let Some(entry) = self.resolve_exact(identity).await? else {
            return Ok(None);
        };
        let key = import_public(&entry.public_key)?;

        if self.config.cache_public_keys {
            self.key_cache.store(identity, key.clone()).await;
        }
        Ok(Some(key))
    }

    /// Drop every cached key.
    pub async fn clear_cache(&self) {
        self.key_cache.clear().await;
    }
}
