//! In-memory relay implementation for testing and single-process runs

use super::{async_trait, Relay};
use crate::{Error, PartyId, Result, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Slot key: (session, round, sender, recipient). Broadcasts have no recipient.
type Slot = (SessionId, u32, PartyId, Option<PartyId>);

/// Endpoint name of the in-process relay
pub const MEMORY_ENDPOINT: &str = "memory://local";

/// In-memory message relay for local testing
pub struct MemoryRelay {
    messages: Arc<DashMap<Slot, Vec<u8>>>,
    /// Notification channel
    notify: broadcast::Sender<()>,
}

impl MemoryRelay {
    /// Create a new in-memory relay
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(100);
        Self {
            messages: Arc::new(DashMap::new()),
            notify,
        }
    }

    /// Number of stored messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove every message of one session, returning how many were dropped
    pub fn clear_session(&self, session_id: &SessionId) -> usize {
        let before = self.messages.len();
        self.messages.retain(|slot, _| slot.0 != *session_id);
        let removed = before.saturating_sub(self.messages.len());
        debug!(%session_id, removed, "Cleared session messages");
        removed
    }

    fn put(&self, slot: Slot, bytes: Vec<u8>) -> Result<()> {
        match self.messages.entry(slot) {
            Entry::Occupied(existing) => {
                // Re-delivery of the same payload is harmless, a different one is not
                if existing.get() != &bytes {
                    return Err(Error::Relay(format!(
                        "conflicting message for round {} from party {}",
                        slot.1, slot.2
                    )));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(bytes);
            }
        }
        let _ = self.notify.send(());
        Ok(())
    }

    async fn collect<T: DeserializeOwned>(&self, slots: Vec<Slot>) -> Result<Vec<T>> {
        let mut rx = self.notify.subscribe();

        loop {
            let ready = slots.iter().all(|slot| self.messages.contains_key(slot));
            if ready {
                return slots
                    .iter()
                    .map(|slot| match self.messages.get(slot) {
                        Some(bytes) => deserialize(bytes.value()),
                        None => Err(Error::Relay("message vanished from relay".into())),
                    })
                    .collect();
            }

            // Wait for notification with timeout
            tokio::select! {
                _ = rx.recv() => continue,
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => continue,
            }
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

#[async_trait]
impl Relay for MemoryRelay {
    fn endpoint(&self) -> &str {
        MEMORY_ENDPOINT
    }

    async fn broadcast<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: PartyId,
        message: &T,
    ) -> Result<()> {
        let bytes = serialize(message)?;
        self.put((*session_id, round, from, None), bytes)
    }

    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: PartyId,
        to: PartyId,
        message: &T,
    ) -> Result<()> {
        let bytes = serialize(message)?;
        self.put((*session_id, round, from, Some(to)), bytes)
    }

    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: &[PartyId],
    ) -> Result<Vec<T>> {
        let slots = from
            .iter()
            .map(|sender| (*session_id, round, *sender, None))
            .collect();
        self.collect(slots).await
    }

    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        to: PartyId,
        from: &[PartyId],
    ) -> Result<Vec<T>> {
        let slots = from
            .iter()
            .map(|sender| (*session_id, round, *sender, Some(to)))
            .collect();
        self.collect(slots).await
    }

    async fn release_session(&self, session_id: &SessionId) {
        self.clear_session(session_id);
    }
}
