//! Relay interfaces: the shared directory and the append-only message log.
//!
//! The relay is untrusted and external. These traits describe the queries the
//! core issues; implementations can sit on any table store with a change
//! feed. In-memory implementations are provided for tests and demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::envelope::{MessageEnvelope, OutgoingEnvelope};
use crate::types::{ExchangeError, Result};

/// One row of the public key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Identity assigned by the identity provider.
    pub identity: String,
    /// Human-chosen handle used for search.
    pub username: String,
    /// Public key as JWK JSON.
    pub public_key: String,
}

/// Table of published public keys, one row per identity.
#[async_trait::async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Insert or replace the row for `entry.identity`.
    async fn upsert(&self, entry: DirectoryEntry) -> Result<()>;

    /// Rows whose username contains `fragment`, case-insensitively.
    async fn search_username(&self, fragment: &str, limit: usize) -> Result<Vec<DirectoryEntry>>;

    /// The row for exactly `identity`.
    async fn get(&self, identity: &str) -> Result<Option<DirectoryEntry>>;
}

/// A change-feed notification from the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A row was inserted.
    Inserted(MessageEnvelope),
    /// The feed connection dropped. No further events follow on this feed.
    Disconnected(String),
}

/// Receiving end of a change feed.
pub type RelayFeed = mpsc::UnboundedReceiver<RelayEvent>;

/// Append-only, queryable, change-notifiable message table.
#[async_trait::async_trait]
pub trait MessageLog: Send + Sync {
    /// Append a row. The relay assigns `id` and `created_at`.
    async fn insert(&self, envelope: OutgoingEnvelope) -> Result<MessageEnvelope>;

    /// Rows where `identity` is sender or receiver, ordered by `created_at` ascending.
    async fn query_for(&self, identity: &str) -> Result<Vec<MessageEnvelope>>;

    /// Open a change feed for inserts. Relays that cannot filter server-side
    /// may deliver rows for other identities; callers filter again.
    async fn listen(&self, identity: &str) -> Result<RelayFeed>;
}

// ============================================================================
// In-memory directory
// ============================================================================

/// In-memory DirectoryStore with a switch to simulate an outage.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    rows: Arc<RwLock<HashMap<String, DirectoryEntry>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `DirectoryUnavailable` until set back to false.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ExchangeError::DirectoryUnavailable(
                "directory offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DirectoryStore for InMemoryDirectory {
    async fn upsert(&self, entry: DirectoryEntry) -> Result<()> {
        self.check_online()?;
        let mut rows = self.rows.write().await;
        rows.insert(entry.identity.clone(), entry);
        Ok(())
    }

    async fn search_username(&self, fragment: &str, limit: usize) -> Result<Vec<DirectoryEntry>> {
        self.check_online()?;
        let needle = fragment.to_lowercase();
        let rows = self.rows.read().await;

        let mut matches: Vec<DirectoryEntry> = rows
            .values()
            .filter(|entry| entry.username.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.username.cmp(&b.username));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn get(&self, identity: &str) -> Result<Option<DirectoryEntry>> {
        self.check_online()?;
        let rows = self.rows.read().await;
        Ok(rows.get(identity).cloned())
    }
}

// ============================================================================
// In-memory message log
// ============================================================================

#[derive(Default)]
struct RelayState {
    rows: RwLock<Vec<MessageEnvelope>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<RelayEvent>>>,
    next_id: AtomicU64,
    last_created_at: Mutex<Option<DateTime<Utc>>>,
    reject_inserts: AtomicBool,
    refuse_listen: AtomicBool,
}

/// In-memory MessageLog that broadcasts every insert to every listener.
///
/// Cloning shares the same log, so two clients built on clones talk to each other.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    state: Arc<RelayState>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inserts fail with `Transmission` until set back to false.
    pub fn set_reject_inserts(&self, reject: bool) {
        self.state.reject_inserts.store(reject, Ordering::SeqCst);
    }

    /// Make new feeds fail to open until set back to false.
    pub fn set_refuse_listen(&self, refuse: bool) {
        self.state.refuse_listen.store(refuse, Ordering::SeqCst);
    }

    /// Drop every open feed, telling listeners why.
    pub async fn disconnect_all(&self, reason: &str) {
        let mut listeners = self.state.listeners.lock().await;
        for listener in listeners.drain(..) {
            let _ = listener.send(RelayEvent::Disconnected(reason.to_string()));
        }
    }

    /// Store a fully formed row and notify listeners, bypassing id and clock
    /// assignment. Used to replay rows in an arbitrary delivery order.
    pub async fn inject(&self, envelope: MessageEnvelope) {
        {
            let mut rows = self.state.rows.write().await;
            rows.push(envelope.clone());
        }
        self.notify(envelope).await;
    }

    /// Number of open feeds.
    pub async fn listener_count(&self) -> usize {
        let mut listeners = self.state.listeners.lock().await;
        listeners.retain(|listener| !listener.is_closed());
        listeners.len()
    }

    async fn notify(&self, envelope: MessageEnvelope) {
        let mut listeners = self.state.listeners.lock().await;
        listeners.retain(|listener| listener.send(RelayEvent::Inserted(envelope.clone())).is_ok());
    }

    async fn assign_created_at(&self) -> DateTime<Utc> {
        let mut last = self.state.last_created_at.lock().await;
        let now = Utc::now();
        let created_at = match *last {
            Some(previous) if previous >= now => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(created_at);
        created_at
    }
}

#[async_trait::async_trait]
impl MessageLog for InMemoryRelay {
    async fn insert(&self, envelope: OutgoingEnvelope) -> Result<MessageEnvelope> {
        if self.state.reject_inserts.load(Ordering::SeqCst) {
            return Err(ExchangeError::Transmission("insert rejected by relay".to_string()));
        }
        if envelope.sender.is_empty() || envelope.receiver.is_empty() {
            return Err(ExchangeError::Transmission(
                "sender and receiver are required".to_string(),
            ));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let created_at = self.assign_created_at().await;
        let stored = envelope.into_envelope(format!("msg-{}", id), created_at);

        {
            let mut rows = self.state.rows.write().await;
            rows.push(stored.clone());
        }
        debug!(id = %stored.id, "relay stored envelope");
        self.notify(stored.clone()).await;
        Ok(stored)
    }

    async fn query_for(&self, identity: &str) -> Result<Vec<MessageEnvelope>> {
        let rows = self.state.rows.read().await;
        let mut matches: Vec<MessageEnvelope> = rows
            .iter()
            .filter(|row| row.involves(identity))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn listen(&self, _identity: &str) -> Result<RelayFeed> {
        if self.state.refuse_listen.load(Ordering::SeqCst) {
            return Err(ExchangeError::SubscriptionDisconnected(
                "relay refused subscription".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.state.listeners.lock().await;
        listeners.push(tx);
        Ok(rx)
    }
}
