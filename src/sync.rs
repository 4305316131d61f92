//! Message synchronization with the relay log.
//!
//! Sending is a single insert with no retry. Receiving combines a full
//! history fetch with a standing feed subscription that reconnects on its
//! own. Each time the feed opens, including the first time, history is
//! fetched again once the listener is registered, so nothing inserted while
//! no feed was listening is lost. Every
//! envelope is turned into a displayable record by [`Materializer`], which
//! never fails: undecryptable envelopes become placeholders.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{decrypt_with_own_key, decrypt_with_shared_key, SharedKeyring};
use crate::envelope::{MessageEnvelope, OutgoingEnvelope, SealedPayload};
use crate::keys::KeyPair;
use crate::models::{MessageBody, MessageDirection, MessageRecord, PlaceholderReason};
use crate::relay::{MessageLog, RelayEvent};
use crate::types::{ExchangeError, Result};

/// Configuration for the feed subscription.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Capacity of the channel between the feed task and its consumer.
    pub feed_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            feed_buffer: 256,
        }
    }
}

impl SyncConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// An event produced by a feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The relay feed is open and the catch-up history has been delivered.
    Connected,
    /// A new envelope involving the subscribed identity.
    Envelope(MessageEnvelope),
    /// The feed dropped; a reconnect is scheduled.
    Reconnecting { attempt: u32, reason: String },
    /// Full history fetched right after the feed opened, covering anything
    /// inserted while no feed was listening. Precedes `Connected`.
    Resynced(Vec<MessageEnvelope>),
}

/// A cancellable standing subscription to the relay feed.
///
/// Dropping the subscription cancels the background task.
pub struct FeedSubscription {
    events: mpsc::Receiver<FeedEvent>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    /// Wait for the next event. `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Stop the background task and wait for it to exit.
    pub async fn unsubscribe(mut self) {
        let _ = self.shutdown.send(true);
        // Unblocks a task waiting on a full channel.
        self.events.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sends to and receives from the shared message log.
pub struct MessageSync<L: MessageLog> {
    log: Arc<L>,
    config: SyncConfig,
}

impl<L: MessageLog + 'static> MessageSync<L> {
    /// Creates a sync client over the given log.
    pub fn new(log: L, config: SyncConfig) -> Self {
        Self {
            log: Arc::new(log),
            config,
        }
    }

    /// Append an envelope to the log.
    ///
    /// No retry is attempted; a failure is returned as `Transmission` for the
    /// caller to surface.
    pub async fn send(&self, sender: &str, receiver: &str, payload: SealedPayload) -> Result<MessageEnvelope> {
        let stored = self
            .log
            .insert(OutgoingEnvelope::new(sender, receiver, payload))
            .await
            .map_err(|e| match e {
                ExchangeError::Transmission(_) => e,
                other => ExchangeError::Transmission(other.to_string()),
            })?;

        debug!(id = %stored.id, sender, receiver, "envelope sent");
        Ok(stored)
    }

    /// Every envelope involving `self_identity`, oldest first.
    pub async fn fetch_history(&self, self_identity: &str) -> Result<Vec<MessageEnvelope>> {
        fetch_history(self.log.as_ref(), self_identity).await
    }

    /// Start a standing feed subscription for `self_identity`.
    pub fn subscribe(&self, self_identity: &str) -> FeedSubscription {
        let (events_tx, events) = mpsc::channel(self.config.feed_buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_feed(
            self.log.clone(),
            self_identity.to_string(),
            self.config.clone(),
            events_tx,
            shutdown_rx,
        ));

        FeedSubscription {
            events,
            shutdown,
            task: Some(task),
        }
    }

    /// Returns the underlying log.
    pub fn log(&self) -> &L {
        &self.log
    }
}

async fn fetch_history<L: MessageLog + ?Sized>(log: &L, self_identity: &str) -> Result<Vec<MessageEnvelope>> {
    let mut rows = log.query_for(self_identity).await?;
    rows.retain(|row| row.involves(self_identity));
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(rows)
}

/// Wait out `delay` unless shutdown is signalled first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_feed<L: MessageLog + ?Sized>(
    log: Arc<L>,
    identity: String,
    config: SyncConfig,
    events: mpsc::Sender<FeedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let opened = tokio::select! {
            _ = shutdown.changed() => return,
            result = log.listen(&identity) => result,
        };

        let error = match opened {
            Ok(mut feed) => {
                let history = tokio::select! {
                    _ = shutdown.changed() => return,
                    history = fetch_history(log.as_ref(), &identity) => history,
                };
                match history {
                    Ok(rows) => {
                        debug!(rows = rows.len(), attempt, "resynced on connect");
                        if events.send(FeedEvent::Resynced(rows)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "resync on connect failed"),
                }

                info!(identity = %identity, "feed connected");
                if events.send(FeedEvent::Connected).await.is_err() {
                    return;
                }
                attempt = 0;

                let reason = loop {
                    let event = tokio::select! {
                        _ = shutdown.changed() => return,
                        event = feed.recv() => event,
                    };
                    match event {
                        Some(RelayEvent::Inserted(envelope)) => {
                            if !envelope.involves(&identity) {
                                continue;
                            }
                            if events.send(FeedEvent::Envelope(envelope)).await.is_err() {
                                return;
                            }
                        }
                        Some(RelayEvent::Disconnected(reason)) => break reason,
                        None => break "feed closed".to_string(),
                    }
                };
                ExchangeError::SubscriptionDisconnected(reason)
            }
            Err(e) => e,
        };

        attempt = attempt.saturating_add(1);
        warn!(attempt, error = %error, "feed lost, reconnecting");
        let notice = FeedEvent::Reconnecting {
            attempt,
            reason: error.to_string(),
        };
        if events.send(notice).await.is_err() {
            return;
        }
        if !pause(config.backoff(attempt), &mut shutdown).await {
            return;
        }
    }
}

/// Turns envelopes into displayable records using whatever keys the session holds.
pub struct Materializer<'a> {
    self_identity: &'a str,
    key_pair: Option<&'a KeyPair>,
    shared_keys: &'a SharedKeyring,
}

impl<'a> Materializer<'a> {
    pub fn new(self_identity: &'a str, key_pair: Option<&'a KeyPair>, shared_keys: &'a SharedKeyring) -> Self {
        Self {
            self_identity,
            key_pair,
            shared_keys,
        }
    }

    /// Decrypt one envelope, or describe why it cannot be shown.
    pub fn materialize(&self, envelope: &MessageEnvelope) -> MessageRecord {
        let direction = if envelope.sender == self.self_identity {
            MessageDirection::Sent
        } else {
            MessageDirection::Received
        };

        let body = match self.decrypt(envelope, direction) {
            Ok(text) => MessageBody::Text(text),
            Err(reason) => MessageBody::Placeholder(reason),
        };

        MessageRecord {
            id: envelope.id.clone(),
            sender: envelope.sender.clone(),
            receiver: envelope.receiver.clone(),
            body,
            created_at: envelope.created_at,
            direction,
        }
    }

    /// Materialize a batch. A failure on one envelope never affects the others.
    pub fn materialize_all<'e>(&self, envelopes: impl IntoIterator<Item = &'e MessageEnvelope>) -> Vec<MessageRecord> {
        envelopes
            .into_iter()
            .map(|envelope| self.materialize(envelope))
            .collect()
    }

    fn decrypt(&self, envelope: &MessageEnvelope, direction: MessageDirection) -> std::result::Result<String, PlaceholderReason> {
        let payload = &envelope.payload;

        let result = match &payload.nonce {
            Some(nonce) => {
                let peer = envelope.counterpart(self.self_identity).unwrap_or(&envelope.sender);
                let Some(key) = self.shared_keys.get(peer) else {
                    return Err(PlaceholderReason::NoSharedKey);
                };
                decrypt_with_shared_key(&payload.ciphertext, nonce, key)
            }
            None => {
                let Some(pair) = self.key_pair else {
                    return Err(PlaceholderReason::NoPrivateKey);
                };
                let ciphertext = match (direction, &payload.sender_ciphertext) {
                    (MessageDirection::Sent, Some(own_copy)) => own_copy,
                    (MessageDirection::Sent, None) if envelope.receiver != self.self_identity => {
                        return Err(PlaceholderReason::Undecryptable);
                    }
                    _ => &payload.ciphertext,
                };
                decrypt_with_own_key(ciphertext, pair.private_key())
            }
        };

        result.map_err(|e| {
            warn!(id = %envelope.id, error = %e, "envelope not decryptable");
            match e {
                ExchangeError::AuthenticationFailed => PlaceholderReason::TamperDetected,
                _ => PlaceholderReason::Undecryptable,
            }
        })
    }
}
