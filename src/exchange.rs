//! Main client for end-to-end encrypted messaging over an untrusted relay.
//!
//! This module wires key management, the directory, the cipher, and message
//! sync together for one signed-in user, and owns the local conversation
//! view that the application renders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{SharedKey, SharedKeyring};
use crate::directory::{DirectoryClient, DirectoryConfig};
use crate::envelope::{MessageEnvelope, SealedPayload};
use crate::keys::{export_public, fingerprint, KeyManager, KeyPair, SerializedPublicKey};
use crate::models::{ConversationView, MessageBody, MessageDirection, MessageRecord};
use crate::relay::{DirectoryEntry, DirectoryStore, MessageLog};
use crate::session::{AuthState, SessionContext};
use crate::storage::SecretStore;
use crate::sync::{FeedEvent, FeedSubscription, Materializer, MessageSync, SyncConfig};
use crate::types::{ExchangeError, Result};

/// Configuration for the exchange client.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Directory search and key cache settings.
    pub directory: DirectoryConfig,
    /// Feed reconnect settings.
    pub sync: SyncConfig,
    /// Capacity of the view update broadcast.
    pub update_buffer: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            sync: SyncConfig::default(),
            update_buffer: 64,
        }
    }
}

/// State of the standing feed, for the application to display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// No feed is open.
    Closed,
    /// A feed task was started and has not connected yet.
    Connecting,
    /// Receiving live inserts.
    Live,
    /// The relay dropped the feed; a reconnect is pending.
    Reconnecting,
}

/// A change to the conversation view caused by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    Connected,
    /// A new record entered the view.
    Message(MessageRecord),
    Reconnecting { attempt: u32 },
    /// History was reapplied when the feed (re)connected; `changed` records were new.
    Resynced { changed: usize },
}

/// State shared between the client and its feed task.
struct SharedState {
    view: RwLock<ConversationView>,
    key_pair: RwLock<Option<Arc<KeyPair>>>,
    shared_keys: RwLock<SharedKeyring>,
    status: RwLock<FeedStatus>,
    /// Bumped whenever the conversation is closed or the session ends; results
    /// computed under an older generation are dropped.
    generation: AtomicU64,
    updates: broadcast::Sender<ViewUpdate>,
}

impl SharedState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn set_status(&self, status: FeedStatus) {
        *self.status.write().await = status;
    }

    /// Drop envelopes whose id is already shown as text; placeholders may still upgrade.
    async fn unseen(&self, mut envelopes: Vec<MessageEnvelope>) -> Vec<MessageEnvelope> {
        let view = self.view.read().await;
        envelopes.retain(|envelope| {
            view.get(&envelope.id)
                .map_or(true, |record| record.body.is_placeholder())
        });
        envelopes
    }

    /// Decrypt a batch on the blocking pool; RSA private key operations are CPU-bound.
    async fn materialize(&self, identity: &str, envelopes: Vec<MessageEnvelope>) -> Result<Vec<MessageRecord>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }
        let key_pair = self.key_pair.read().await.clone();
        let shared_keys = self.shared_keys.read().await.clone();
        let identity = identity.to_string();

        tokio::task::spawn_blocking(move || {
            Materializer::new(&identity, key_pair.as_deref(), &shared_keys).materialize_all(&envelopes)
        })
        .await
        .map_err(|e| ExchangeError::Decryption(format!("Materialize task failed: {}", e)))
    }
}

struct FeedWorker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The exchange client for one device.
pub struct SecureExchange<D, L, S>
where
    D: DirectoryStore,
    L: MessageLog,
    S: SecretStore,
{
    /// Configuration.
    config: ExchangeConfig,
    /// Public key directory.
    directory: DirectoryClient<D>,
    /// Relay log access.
    sync: MessageSync<L>,
    /// Local private key slot.
    keys: KeyManager<S>,
    /// Signed-in session, if any.
    session: RwLock<Option<SessionContext>>,
    state: Arc<SharedState>,
    feed: Mutex<Option<FeedWorker>>,
}

impl<D, L, S> SecureExchange<D, L, S>
where
    D: DirectoryStore,
    L: MessageLog + 'static,
    S: SecretStore,
{
    /// Creates a client over the given collaborators. No session is open yet.
    pub fn new(directory: D, log: L, secrets: S, config: ExchangeConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        Self {
            directory: DirectoryClient::new(directory, config.directory.clone()),
            sync: MessageSync::new(log, config.sync.clone()),
            keys: KeyManager::new(secrets),
            session: RwLock::new(None),
            state: Arc::new(SharedState {
                view: RwLock::new(ConversationView::new()),
                key_pair: RwLock::new(None),
                shared_keys: RwLock::new(SharedKeyring::new()),
                status: RwLock::new(FeedStatus::Closed),
                generation: AtomicU64::new(0),
                updates,
            }),
            feed: Mutex::new(None),
            config,
        }
    }

    /// React to an identity provider notification.
    ///
    /// Signing in loads this device's private key if one exists. Signing out,
    /// or signing in as someone else, ends the current session first.
    pub async fn apply_auth(&self, auth: &AuthState) -> Result<()> {
        let Some(next) = SessionContext::from_auth(auth) else {
            self.logout().await;
            return Ok(());
        };

        let current = self.session.read().await.as_ref().map(|s| s.self_identity().to_string());
        match current {
            Some(identity) if identity == next.self_identity() => return Ok(()),
            Some(_) => self.logout().await,
            None => {}
        }

        let key_pair = self.keys.load_key_pair().await?;
        info!(
            identity = next.self_identity(),
            has_key = key_pair.is_some(),
            "session opened"
        );
        *self.state.key_pair.write().await = key_pair.map(Arc::new);
        *self.session.write().await = Some(next);
        Ok(())
    }

    /// Ensure this device has a key pair and publish its public half under `username`.
    pub async fn bootstrap(&self, username: &str) -> Result<SerializedPublicKey> {
        let identity = self.self_identity().await?;

        let pair = self.keys.load_or_generate().await?;
        let public = export_public(&pair);
        *self.state.key_pair.write().await = Some(Arc::new(pair));

        self.directory.publish(&identity, username, &public).await?;
        Ok(public)
    }

    /// Search the directory for other users by username fragment.
    pub async fn search_users(&self, fragment: &str) -> Result<Vec<DirectoryEntry>> {
        let identity = self.self_identity().await?;
        self.directory.resolve(&identity, fragment).await
    }

    /// Change the selected peer and return its conversation.
    ///
    /// The existing view is re-filtered; history is only fetched when nothing
    /// loaded so far could contain messages with the peer. Selecting a peer
    /// opens the feed, which catches up on anything inserted while it was
    /// closed; deselecting closes the conversation.
    pub async fn select_peer(&self, peer: Option<&str>) -> Result<Vec<MessageRecord>> {
        let identity = {
            let mut session = self.session.write().await;
            let session = session.as_mut().ok_or(ExchangeError::NotSignedIn)?;
            session.select_peer(peer.map(str::to_string));
            session.self_identity().to_string()
        };

        let Some(peer) = peer else {
            self.close_conversation().await;
            return Ok(Vec::new());
        };

        self.open_feed().await?;
        let needs_fetch = self.state.view.read().await.needs_fetch(&identity, peer);
        if needs_fetch {
            debug!(peer, "no messages loaded for peer, fetching history");
            self.refresh().await?;
        }
        self.conversation().await
    }

    /// Encrypt `text` for `receiver` and append it to the relay log.
    ///
    /// The receiver's key comes from the directory. A copy sealed to our own
    /// key rides along so this device can read its sent history later.
    pub async fn send_text(&self, receiver: &str, text: &str) -> Result<MessageRecord> {
        let identity = self.self_identity().await?;

        let recipient_key = self
            .directory
            .resolve_key(receiver)
            .await?
            .ok_or_else(|| ExchangeError::RecipientKeyNotFound(receiver.to_string()))?;
        let own = self.state.key_pair.read().await.clone();
        let payload = SealedPayload::for_recipient(text, &recipient_key, own.as_ref().map(|p| p.public_key()))?;

        self.deliver(&identity, receiver, payload, text).await
    }

    /// Send `text` to the selected peer.
    pub async fn send_to_selected(&self, text: &str) -> Result<MessageRecord> {
        let peer = self.selected_peer().await?;
        self.send_text(&peer, text).await
    }

    /// Encrypt `text` under the shared key installed for `receiver` and send it.
    pub async fn send_text_shared(&self, receiver: &str, text: &str) -> Result<MessageRecord> {
        let identity = self.self_identity().await?;
        let key = self
            .state
            .shared_keys
            .read()
            .await
            .get(receiver)
            .cloned()
            .ok_or_else(|| ExchangeError::RecipientKeyNotFound(receiver.to_string()))?;
        let payload = SealedPayload::with_shared_key(text, &key)?;

        self.deliver(&identity, receiver, payload, text).await
    }

    /// Install a shared key agreed with `peer` out of band.
    pub async fn set_shared_key(&self, peer: &str, key: SharedKey) {
        self.state.shared_keys.write().await.insert(peer, key);
    }

    async fn deliver(&self, identity: &str, receiver: &str, payload: SealedPayload, text: &str) -> Result<MessageRecord> {
        let generation = self.state.generation.load(Ordering::SeqCst);
        let stored = self.sync.send(identity, receiver, payload).await?;

        let record = MessageRecord {
            id: stored.id,
            sender: stored.sender,
            receiver: stored.receiver,
            body: MessageBody::Text(text.to_string()),
            created_at: stored.created_at,
            direction: MessageDirection::Sent,
        };
        if self.state.is_current(generation) {
            self.state.view.write().await.apply(record.clone());
        } else {
            debug!(id = %record.id, "session changed during send, not appending");
        }
        Ok(record)
    }

    /// Fetch the full history and merge it into the view.
    ///
    /// Returns how many records were new. Results are dropped if the
    /// conversation was closed while the fetch was in flight.
    pub async fn refresh(&self) -> Result<usize> {
        let identity = self.self_identity().await?;
        let generation = self.state.generation.load(Ordering::SeqCst);

        let rows = self.sync.fetch_history(&identity).await?;
        let fetched = rows.len();
        let pending = self.state.unseen(rows).await;
        let records = self.state.materialize(&identity, pending).await?;

        if !self.state.is_current(generation) {
            debug!("conversation closed during refresh, discarding results");
            return Ok(0);
        }

        let mut view = self.state.view.write().await;
        let changed = view.merge(records);
        view.mark_history_loaded();
        debug!(rows = fetched, changed, "history applied");
        Ok(changed)
    }

    /// Start the standing feed task if it is not already running.
    pub async fn open_feed(&self) -> Result<()> {
        let identity = self.self_identity().await?;
        let mut feed = self.feed.lock().await;
        if feed.is_some() {
            return Ok(());
        }

        let subscription = self.sync.subscribe(&identity);
        let generation = self.state.generation.load(Ordering::SeqCst);
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.state.set_status(FeedStatus::Connecting).await;

        let task = tokio::spawn(apply_feed(
            self.state.clone(),
            identity,
            subscription,
            generation,
            shutdown_rx,
        ));
        *feed = Some(FeedWorker { shutdown, task });
        Ok(())
    }

    /// Stop the feed, deselect the peer, and drop any results still in flight,
    /// including optimistic appends of sends that have not completed.
    pub async fn close_conversation(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);

        let worker = self.feed.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            let _ = worker.task.await;
        }
        self.state.set_status(FeedStatus::Closed).await;

        if let Some(session) = self.session.write().await.as_mut() {
            session.select_peer(None);
        }
    }

    /// End the session: stop the feed and discard the view and loaded keys.
    ///
    /// The persisted private key stays in the secret store.
    pub async fn logout(&self) {
        self.close_conversation().await;
        self.state.view.write().await.clear();
        *self.state.key_pair.write().await = None;
        self.state.shared_keys.write().await.clear();
        self.directory.clear_cache().await;

        if let Some(session) = self.session.write().await.take() {
            info!(identity = session.self_identity(), "session closed");
        }
    }

    /// Records exchanged with the selected peer, oldest first.
    pub async fn conversation(&self) -> Result<Vec<MessageRecord>> {
        let (identity, peer) = {
            let session = self.session.read().await;
            let session = session.as_ref().ok_or(ExchangeError::NotSignedIn)?;
            let peer = session.selected_peer().ok_or(ExchangeError::NoPeerSelected)?;
            (session.self_identity().to_string(), peer.to_string())
        };

        let view = self.state.view.read().await;
        Ok(view.between(&identity, &peer).cloned().collect())
    }

    /// Every record in the view, oldest first.
    pub async fn records(&self) -> Vec<MessageRecord> {
        self.state.view.read().await.records().cloned().collect()
    }

    /// Receive view updates produced by the feed.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ViewUpdate> {
        self.state.updates.subscribe()
    }

    pub async fn feed_status(&self) -> FeedStatus {
        *self.state.status.read().await
    }

    /// Returns a copy of the current session.
    pub async fn session(&self) -> Option<SessionContext> {
        self.session.read().await.clone()
    }

    /// Fingerprint of the loaded public key, if a key is loaded.
    pub async fn key_fingerprint(&self) -> Option<String> {
        self.state
            .key_pair
            .read()
            .await
            .as_ref()
            .map(|pair| fingerprint(pair.public_key()))
    }

    /// Returns the directory client.
    pub fn directory(&self) -> &DirectoryClient<D> {
        &self.directory
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    async fn self_identity(&self) -> Result<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.self_identity().to_string())
            .ok_or(ExchangeError::NotSignedIn)
    }

    async fn selected_peer(&self) -> Result<String> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(ExchangeError::NotSignedIn)?;
        session
            .selected_peer()
            .map(str::to_string)
            .ok_or(ExchangeError::NoPeerSelected)
    }
}

/// Feed task: applies every feed event to the view until shut down.
async fn apply_feed(
    state: Arc<SharedState>,
    identity: String,
    mut subscription: FeedSubscription,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = subscription.next() => event,
        };
        let Some(event) = event else { break };

        let update = match event {
            FeedEvent::Connected => {
                state.set_status(FeedStatus::Live).await;
                ViewUpdate::Connected
            }
            FeedEvent::Reconnecting { attempt, .. } => {
                state.set_status(FeedStatus::Reconnecting).await;
                ViewUpdate::Reconnecting { attempt }
            }
            FeedEvent::Envelope(envelope) => {
                let pending = state.unseen(vec![envelope]).await;
                let mut records = match state.materialize(&identity, pending).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "feed envelope not applied");
                        continue;
                    }
                };
                if !state.is_current(generation) {
                    break;
                }
                let Some(record) = records.pop() else { continue };
                if !state.view.write().await.apply(record.clone()) {
                    continue;
                }
                ViewUpdate::Message(record)
            }
            FeedEvent::Resynced(rows) => {
                let pending = state.unseen(rows).await;
                let records = match state.materialize(&identity, pending).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "resync not applied");
                        continue;
                    }
                };
                if !state.is_current(generation) {
                    break;
                }
                let changed = {
                    let mut view = state.view.write().await;
                    let changed = view.merge(records);
                    view.mark_history_loaded();
                    changed
                };
                ViewUpdate::Resynced { changed }
            }
        };

        let _ = state.updates.send(update);
    }

    subscription.unsubscribe().await;
}
