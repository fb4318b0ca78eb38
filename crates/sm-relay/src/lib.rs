//! State-Machine Relay
//!
//! Store for the round messages parties exchange during keygen and signing.
//! Each slot (session, round, sender, recipient) can be written once; a
//! second write with the same payload is accepted as a retry, a second write
//! with a different payload is rejected. Messages expire after a TTL.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Message not found: {0}")]
    NotFound(String),
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Conflicting message for slot {0}")]
    Conflict(String),
    #[error("Message TTL must be within 0..={max} seconds, got {0}", max = MAX_TTL_SECONDS)]
    InvalidTtl(i64),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Longest accepted message TTL: one year
pub const MAX_TTL_SECONDS: i64 = 365 * 24 * 60 * 60;

const DEFAULT_TTL_SECONDS: i64 = 3600;

/// Message slot
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageId {
    /// Session identifier
    pub session_id: String,
    /// Round number
    pub round: u32,
    /// Sender party ID
    pub from: usize,
    /// Receiver party ID (None for broadcasts)
    pub to: Option<usize>,
}

impl MessageId {
    pub fn broadcast(session_id: &str, round: u32, from: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            round,
            from,
            to: None,
        }
    }

    pub fn direct(session_id: &str, round: u32, from: usize, to: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            round,
            from,
            to: Some(to),
        }
    }

    /// Compute hash for lookup
    pub fn hash(&self) -> String {
        let data = format!(
            "{}:{}:{}:{}",
            self.session_id,
            self.round,
            self.from,
            self.to.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string()),
        );
        hex::encode(blake3::hash(data.as_bytes()).as_bytes())
    }
}

/// Stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Same payload was already present
    Duplicate,
}

/// Message relay store
#[derive(Clone)]
pub struct MessageStore {
    /// Messages indexed by hash
    messages: Arc<DashMap<String, StoredMessage>>,
    /// Lifetime of a stored message
    ttl: chrono::Duration,
}

impl MessageStore {
    /// Fails with [`RelayError::InvalidTtl`] outside `0..=MAX_TTL_SECONDS`
    pub fn new(ttl_seconds: i64) -> Result<Self> {
        if !(0..=MAX_TTL_SECONDS).contains(&ttl_seconds) {
            return Err(RelayError::InvalidTtl(ttl_seconds));
        }
        Ok(Self::with_ttl(chrono::Duration::seconds(ttl_seconds)))
    }

    fn with_ttl(ttl: chrono::Duration) -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Store a message; the first write to a slot wins
    pub fn put(&self, id: MessageId, payload: Vec<u8>) -> Result<PutOutcome> {
        let hash = id.hash();
        let now = Utc::now();

        match self.messages.entry(hash.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().expires_at <= now {
                    existing.insert(self.stored(id, payload, now));
                    return Ok(PutOutcome::Stored);
                }
                if existing.get().payload == payload {
                    debug!(slot = %hash, "Duplicate message ignored");
                    return Ok(PutOutcome::Duplicate);
                }
                warn!(
                    session_id = %id.session_id,
                    round = id.round,
                    from = id.from,
                    "Rejected conflicting message"
                );
                Err(RelayError::Conflict(hash))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.stored(id, payload, now));
                Ok(PutOutcome::Stored)
            }
        }
    }

    /// Get a live message by ID
    pub fn get(&self, id: &MessageId) -> Result<StoredMessage> {
        let hash = id.hash();
        let now = Utc::now();

        self.messages
            .get(&hash)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::NotFound(hash))
    }

    pub fn exists(&self, id: &MessageId) -> bool {
        self.get(id).is_ok()
    }

    /// Remove expired messages, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let before = self.messages.len();
        self.messages.retain(|_, v| v.expires_at > now);
        let removed = before.saturating_sub(self.messages.len());
        if removed > 0 {
            debug!(removed, "Expired messages removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn stored(&self, id: MessageId, payload: Vec<u8>, now: DateTime<Utc>) -> StoredMessage {
        StoredMessage {
            id,
            payload,
            created_at: now,
            expires_at: now + self.ttl,
        }
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::with_ttl(chrono::Duration::seconds(DEFAULT_TTL_SECONDS))
    }
}

/// JSON bodies of the relay HTTP API
pub mod wire {
    use super::{MessageId, RelayError};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Serialize};

    /// Body of `POST /v1/msg`
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PostMessageRequest {
        #[serde(flatten)]
        pub id: MessageId,
        /// base64 encoded
        pub payload: String,
    }

    impl PostMessageRequest {
        pub fn new(id: MessageId, payload: &[u8]) -> Self {
            Self {
                id,
                payload: STANDARD.encode(payload),
            }
        }

        pub fn decode_payload(&self) -> Result<Vec<u8>, RelayError> {
            STANDARD
                .decode(&self.payload)
                .map_err(|e| RelayError::InvalidFormat(format!("Invalid base64: {}", e)))
        }
    }

    /// Body of `POST /v1/msg/get`
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GetMessageRequest {
        #[serde(flatten)]
        pub id: MessageId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PostMessageResponse {
        pub hash: String,
        pub duplicate: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessageResponse {
        pub found: bool,
        /// base64 encoded
        pub payload: Option<String>,
    }

    impl MessageResponse {
        pub fn found(payload: &[u8]) -> Self {
            Self {
                found: true,
                payload: Some(STANDARD.encode(payload)),
            }
        }

        pub fn missing() -> Self {
            Self {
                found: false,
                payload: None,
            }
        }

        pub fn decode_payload(&self) -> Result<Option<Vec<u8>>, RelayError> {
            match (&self.payload, self.found) {
                (Some(payload), true) => STANDARD
                    .decode(payload)
                    .map(Some)
                    .map_err(|e| RelayError::InvalidFormat(format!("Invalid base64: {}", e))),
                _ => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_hash() {
        let id1 = MessageId::direct("session1", 1, 0, 1);
        let id2 = MessageId::direct("session1", 1, 0, 1);
        let id3 = MessageId::direct("session1", 2, 0, 1);
        let id4 = MessageId::broadcast("session1", 1, 0);

        assert_eq!(id1.hash(), id2.hash());
        assert_ne!(id1.hash(), id3.hash());
        assert_ne!(id1.hash(), id4.hash());
    }

    #[test]
    fn test_message_store() {
        let store = MessageStore::new(3600).unwrap();
        let id = MessageId::broadcast("session1", 1, 0);

        assert_eq!(store.put(id.clone(), vec![1, 2, 3]).unwrap(), PutOutcome::Stored);
        assert!(store.exists(&id));
        assert_eq!(store.get(&id).unwrap().payload, vec![1, 2, 3]);
        assert!(matches!(
            store.get(&MessageId::broadcast("session1", 1, 1)),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn test_first_write_wins() {
        let store = MessageStore::new(3600).unwrap();
        let id = MessageId::direct("session1", 3, 2, 0);

        store.put(id.clone(), vec![9]).unwrap();
        assert_eq!(store.put(id.clone(), vec![9]).unwrap(), PutOutcome::Duplicate);
        assert!(matches!(store.put(id.clone(), vec![8]), Err(RelayError::Conflict(_))));
        assert_eq!(store.get(&id).unwrap().payload, vec![9]);
    }

    #[test]
    fn test_expired_messages() {
        let store = MessageStore::new(0).unwrap();
        let id = MessageId::broadcast("session1", 1, 0);

        store.put(id.clone(), vec![1]).unwrap();
        assert!(!store.exists(&id));
        // An expired slot can be written again
        assert_eq!(store.put(id.clone(), vec![2]).unwrap(), PutOutcome::Stored);
        assert_eq!(store.cleanup(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_ttl_bounds() {
        assert_eq!(MessageStore::default().ttl_seconds(), 3600);
        assert_eq!(MessageStore::new(MAX_TTL_SECONDS).unwrap().ttl_seconds(), MAX_TTL_SECONDS);
        assert!(matches!(MessageStore::new(-1), Err(RelayError::InvalidTtl(-1))));
        assert!(matches!(
            MessageStore::new(i64::MAX),
            Err(RelayError::InvalidTtl(i64::MAX))
        ));
        assert!(matches!(
            MessageStore::new(MAX_TTL_SECONDS + 1),
            Err(RelayError::InvalidTtl(_))
        ));
    }

    #[test]
    fn test_wire_shape() {
        let req = wire::PostMessageRequest::new(MessageId::direct("abc", 2, 1, 0), b"hi");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["round"], 2);
        assert_eq!(json["to"], 0);
        assert_eq!(json["payload"], "aGk=");
        assert_eq!(req.decode_payload().unwrap(), b"hi");

        let missing = wire::MessageResponse::missing();
        assert_eq!(missing.decode_payload().unwrap(), None);
    }
}
