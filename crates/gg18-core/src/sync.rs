//! Best-effort notifications to an external custody/audit service
//!
//! A driver notifies its [`ExternalSync`] before context creation, before each
//! round and after the terminal round. Failures never affect the session; they
//! are logged and handed back to the caller as [`SyncWarning`]s.

use crate::engine::SessionKind;
use crate::error::SyncError;
use crate::types::{EthAddress, MessageDigest, PartyId, SessionId, ThresholdConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use ::async_trait::async_trait;

/// Point in a party's schedule a notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "round")]
pub enum Checkpoint {
    SessionStart,
    Round(u32),
    SessionEnd,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::SessionStart => write!(f, "start"),
            Checkpoint::Round(round) => write!(f, "round {}", round),
            Checkpoint::SessionEnd => write!(f, "end"),
        }
    }
}

/// Custody identity attached to every notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyIdentity {
    pub user_id: Option<String>,
    pub key_name: Option<String>,
}

/// One notification
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub kind: SessionKind,
    pub session_id: SessionId,
    pub party_id: PartyId,
    pub checkpoint: Checkpoint,
    pub config: ThresholdConfig,
    pub identity: CustodyIdentity,
    /// Signing only
    pub digest: Option<MessageDigest>,
    /// Signing only: address of the key being used
    pub user_address: Option<EthAddress>,
}

/// Side channel notified around every round
#[async_trait]
pub trait ExternalSync: Send + Sync {
    async fn notify(&self, event: &SyncEvent) -> Result<(), SyncError>;
}

/// Sync adapter that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSync;

#[async_trait]
impl ExternalSync for NoopSync {
    async fn notify(&self, _event: &SyncEvent) -> Result<(), SyncError> {
        Ok(())
    }
}

/// A failed notification, returned next to a successful result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncWarning {
    pub party_id: PartyId,
    pub checkpoint: Checkpoint,
    pub message: String,
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "party {} at {}: {}",
            self.party_id, self.checkpoint, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_serialization() {
        let json = serde_json::to_string(&Checkpoint::Round(3)).unwrap();
        assert_eq!(json, r#"{"stage":"round","round":3}"#);
        let json = serde_json::to_string(&Checkpoint::SessionStart).unwrap();
        assert_eq!(json, r#"{"stage":"session_start"}"#);
    }

    #[tokio::test]
    async fn test_noop_sync() {
        let event = SyncEvent {
            kind: SessionKind::Keygen,
            session_id: SessionId::new_v4(),
            party_id: 0,
            checkpoint: Checkpoint::SessionStart,
            config: ThresholdConfig::new(1, 3).unwrap(),
            identity: CustodyIdentity::default(),
            digest: None,
            user_address: None,
        };
        assert!(NoopSync.notify(&event).await.is_ok());
    }
}
