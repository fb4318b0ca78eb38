//! Interface to the round-advancing MPC engine
//!
//! The orchestration layer never looks inside a [`PartyContext`]. It only
//! asks the engine to create one and to advance it round by round.

pub mod local;

use crate::context::{PartyContext, RoundOutput};
use crate::error::EngineError;
use crate::types::{KeyMaterial, MessageDigest, PartyId, SessionId, ThresholdConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

pub use ::async_trait::async_trait;
pub use local::LocalEngine;

/// Which protocol a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Keygen,
    Sign,
}

impl SessionKind {
    /// Ordered rounds run after context creation
    pub fn rounds(self) -> RangeInclusive<u32> {
        match self {
            SessionKind::Keygen => 1..=5,
            SessionKind::Sign => 0..=9,
        }
    }

    pub fn first_round(self) -> u32 {
        *self.rounds().start()
    }

    /// Round that yields the artifact
    pub fn terminal_round(self) -> u32 {
        *self.rounds().end()
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Keygen => write!(f, "keygen"),
            SessionKind::Sign => write!(f, "sign"),
        }
    }
}

/// Inputs common to every context creation
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Shared relay address
    pub relay_addr: String,
    pub session_id: SessionId,
    pub party_id: PartyId,
    pub config: ThresholdConfig,
}

/// The opaque cryptographic engine.
///
/// Every call may suspend while the engine exchanges messages through the
/// relay. Any outcome other than a valid next context or terminal artifact is
/// an [`EngineError`].
#[async_trait]
pub trait MpcEngine: Send + Sync {
    /// Create the initial keygen context for one party
    async fn keygen_context(&self, params: &ContextParams) -> Result<PartyContext, EngineError>;

    /// Create the initial signing context for one participant
    async fn sign_context(
        &self,
        params: &ContextParams,
        key: &KeyMaterial,
        digest: &MessageDigest,
        signers: &[PartyId],
    ) -> Result<PartyContext, EngineError>;

    /// Run one round, consuming the previous context
    async fn round(
        &self,
        kind: SessionKind,
        context: PartyContext,
        round: u32,
    ) -> Result<RoundOutput, EngineError>;

    /// Drop whatever the engine still holds for a finished session
    async fn release_session(&self, _session_id: &SessionId) {}
}
