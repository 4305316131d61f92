//! Data models for the local conversation view.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

/// Why a message could not be shown as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderReason {
    /// This device has no private key yet.
    NoPrivateKey,
    /// The envelope uses a shared key this session does not hold.
    NoSharedKey,
    /// The AEAD tag did not verify.
    TamperDetected,
    /// Any other decryption or encoding failure (wrong key, bad padding, bad base64).
    Undecryptable,
}

impl PlaceholderReason {
    /// Text shown in place of the message body.
    pub fn display_text(&self) -> &'static str {
        match self {
            Self::NoPrivateKey => "[no private key stored locally]",
            Self::NoSharedKey => "[no shared key for this conversation]",
            Self::TamperDetected => "[message failed integrity check]",
            Self::Undecryptable => "[decrypt error]",
        }
    }
}

/// Body of a materialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Placeholder(PlaceholderReason),
}

impl MessageBody {
    /// Displayable text, decrypted or placeholder.
    pub fn display(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Placeholder(reason) => reason.display_text(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Placeholder(_) => None,
        }
    }
}

/// Direction of a message relative to the current user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDirection {
    /// Message was sent by the current user.
    Sent,
    /// Message was received by the current user.
    Received,
}

/// A materialized message: one envelope turned into something displayable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Envelope id assigned by the relay.
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub body: MessageBody,
    /// Relay-assigned insertion time.
    pub created_at: DateTime<Utc>,
    pub direction: MessageDirection,
}

impl MessageRecord {
    /// Whether this record travels between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }
}

/// Time-ordered, deduplicated set of materialized messages for one session.
///
/// Records are keyed by envelope id, so delivering the same envelope through
/// a fetch and a feed notification leaves a single entry. Iteration is
/// ascending by `(created_at, id)` regardless of arrival order.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    ordered: BTreeMap<(DateTime<Utc>, String), MessageRecord>,
    by_id: HashMap<String, DateTime<Utc>>,
    history_loaded: bool,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Returns true if the view changed.
    ///
    /// A record already present is kept, except that a decrypted body replaces
    /// a placeholder for the same id.
    pub fn apply(&mut self, record: MessageRecord) -> bool {
        if let Some(created_at) = self.by_id.get(&record.id) {
            let key = (*created_at, record.id.clone());
            let upgrade = matches!(self.ordered.get(&key), Some(existing)
                if existing.body.is_placeholder() && !record.body.is_placeholder());
            if upgrade {
                self.ordered.insert(key, record);
            }
            return upgrade;
        }

        self.by_id.insert(record.id.clone(), record.created_at);
        self.ordered.insert((record.created_at, record.id.clone()), record);
        true
    }

    /// Adds many records. Returns how many changed the view.
    pub fn merge(&mut self, records: impl IntoIterator<Item = MessageRecord>) -> usize {
        records
            .into_iter()
            .map(|record| self.apply(record))
            .filter(|changed| *changed)
            .count()
    }

    /// All records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &MessageRecord> {
        self.ordered.values()
    }

    /// Records exchanged between `self_identity` and `peer`, oldest first.
    pub fn between<'a>(&'a self, self_identity: &'a str, peer: &'a str) -> impl Iterator<Item = &'a MessageRecord> {
        self.ordered
            .values()
            .filter(move |record| record.is_between(self_identity, peer))
    }

    pub fn get(&self, id: &str) -> Option<&MessageRecord> {
        let created_at = self.by_id.get(id)?;
        self.ordered.get(&(*created_at, id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Record that a full history fetch has been applied.
    pub fn mark_history_loaded(&mut self) {
        self.history_loaded = true;
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded
    }

    /// Whether selecting `peer` needs a fetch: nothing has been loaded that
    /// could contain messages with them.
    pub fn needs_fetch(&self, self_identity: &str, peer: &str) -> bool {
        !self.history_loaded && self.between(self_identity, peer).next().is_none()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Discard every record.
    pub fn clear(&mut self) {
        self.ordered.clear();
        self.by_id.clear();
        self.history_loaded = false;
    }
}
