//! Envelopes: the records the relay stores and forwards.
//!
//! The relay only ever sees routing identities, a relay-assigned id and
//! timestamp, and opaque base64 ciphertext.

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{encrypt_for_recipient, encrypt_with_shared_key, SharedKey};
use crate::types::{ExchangeError, Result};

/// Encrypted content of a message, before the relay assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Base64 ciphertext for the receiver.
    pub ciphertext: String,
    /// Base64 nonce; present only for the shared-key variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 copy of the plaintext sealed to the sender's own key, so the
    /// sender can read its own history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_ciphertext: Option<String>,
}

impl SealedPayload {
    /// Seal `plaintext` to the recipient, and to the sender when `sender_key` is given.
    pub fn for_recipient(
        plaintext: &str,
        recipient_key: &RsaPublicKey,
        sender_key: Option<&RsaPublicKey>,
    ) -> Result<Self> {
        let ciphertext = encrypt_for_recipient(plaintext, recipient_key)?;
        let sender_ciphertext = sender_key
            .map(|key| encrypt_for_recipient(plaintext, key))
            .transpose()?;

        Ok(Self {
            ciphertext,
            nonce: None,
            sender_ciphertext,
        })
    }

    /// Seal `plaintext` under a shared key. Both parties read the same ciphertext.
    pub fn with_shared_key(plaintext: &str, key: &SharedKey) -> Result<Self> {
        let sealed = encrypt_with_shared_key(plaintext, key)?;
        Ok(Self {
            ciphertext: sealed.ciphertext,
            nonce: Some(sealed.nonce),
            sender_ciphertext: None,
        })
    }
}

/// A message on its way to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    pub sender: String,
    pub receiver: String,
    #[serde(flatten)]
    pub payload: SealedPayload,
}

impl OutgoingEnvelope {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, payload: SealedPayload) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            payload,
        }
    }

    /// Attach the relay-assigned id and insertion time.
    pub fn into_envelope(self, id: impl Into<String>, created_at: DateTime<Utc>) -> MessageEnvelope {
        MessageEnvelope {
            id: id.into(),
            sender: self.sender,
            receiver: self.receiver,
            payload: self.payload,
            created_at,
        }
    }
}

/// A message as stored by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Relay-assigned id, stable across fetches and feed deliveries.
    pub id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(flatten)]
    pub payload: SealedPayload,
    /// Relay-assigned insertion time.
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Whether `identity` sent or received this envelope.
    pub fn involves(&self, identity: &str) -> bool {
        self.sender == identity || self.receiver == identity
    }

    /// Whether this envelope travels between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }

    /// The other party from the point of view of `self_identity`.
    pub fn counterpart(&self, self_identity: &str) -> Option<&str> {
        if self.sender == self_identity {
            Some(&self.receiver)
        } else if self.receiver == self_identity {
            Some(&self.sender)
        } else {
            None
        }
    }

    /// Encode as a JSON row.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ExchangeError::Encoding(format!("Envelope encoding failed: {}", e)))
    }

    /// Decode a JSON row.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExchangeError::Encoding(format!("Invalid envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt_with_own_key, decrypt_with_shared_key};
    use crate::keys::tests::test_keys;
    use chrono::TimeZone;

    fn envelope(sender: &str, receiver: &str) -> MessageEnvelope {
        OutgoingEnvelope::new(
            sender,
            receiver,
            SealedPayload {
                ciphertext: "Y2lwaGVy".to_string(),
                nonce: None,
                sender_ciphertext: None,
            },
        )
        .into_envelope("m1", Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn test_routing_helpers() {
        let env = envelope("A", "B");
        assert!(env.involves("A"));
        assert!(env.involves("B"));
        assert!(!env.involves("C"));
        assert!(env.is_between("B", "A"));
        assert!(!env.is_between("A", "C"));
        assert_eq!(env.counterpart("A"), Some("B"));
        assert_eq!(env.counterpart("B"), Some("A"));
        assert_eq!(env.counterpart("C"), None);
    }

    #[test]
    fn test_json_row_shape() {
        let env = envelope("A", "B");
        let json = env.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["id"], "m1");
        assert_eq!(value["ciphertext"], "Y2lwaGVy");
        assert!(value.get("nonce").is_none());
        assert!(value.get("payload").is_none());
        assert_eq!(MessageEnvelope::from_json(&json).unwrap(), env);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            MessageEnvelope::from_json("{\"id\": 1}"),
            Err(ExchangeError::Encoding(_))
        ));
    }

    #[test]
    fn test_payload_for_recipient_and_sender() {
        let (alice, bob) = test_keys();
        let payload =
            SealedPayload::for_recipient("hi bob", bob.public_key(), Some(alice.public_key())).unwrap();

        assert!(payload.nonce.is_none());
        assert_eq!(decrypt_with_own_key(&payload.ciphertext, bob.private_key()).unwrap(), "hi bob");
        let own_copy = payload.sender_ciphertext.as_deref().unwrap();
        assert_eq!(decrypt_with_own_key(own_copy, alice.private_key()).unwrap(), "hi bob");
    }

    #[test]
    fn test_payload_with_shared_key() {
        let key = SharedKey::generate();
        let payload = SealedPayload::with_shared_key("hi", &key).unwrap();
        let nonce = payload.nonce.as_deref().unwrap();
        assert_eq!(decrypt_with_shared_key(&payload.ciphertext, nonce, &key).unwrap(), "hi");
    }
}
