//! Relay ("state-machine server") abstraction used by the engine

use crate::{PartyId, Result, SessionId};
use serde::{de::DeserializeOwned, Serialize};

pub use ::async_trait::async_trait;

/// Message relay trait for MPC communication.
///
/// Collected messages are returned in the order of the `from` slice, so a
/// party can index them by position.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Address contexts must name to use this relay
    fn endpoint(&self) -> &str;

    /// Broadcast a message to all parties
    async fn broadcast<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: PartyId,
        message: &T,
    ) -> Result<()>;

    /// Send a direct message to a specific party
    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: PartyId,
        to: PartyId,
        message: &T,
    ) -> Result<()>;

    /// Collect one broadcast from each listed sender
    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: &[PartyId],
    ) -> Result<Vec<T>>;

    /// Collect one direct message addressed to `to` from each listed sender
    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        to: PartyId,
        from: &[PartyId],
    ) -> Result<Vec<T>>;

    /// Forget every message of a finished session
    async fn release_session(&self, _session_id: &SessionId) {}
}

/// In-memory relay for testing
pub mod memory;

pub use memory::{MemoryRelay, MEMORY_ENDPOINT};
