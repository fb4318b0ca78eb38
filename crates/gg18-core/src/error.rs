//! Error types for GG18 sessions

use crate::types::PartyId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine and relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while a party exchanges round messages
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid party configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid party ID
    #[error("Invalid party ID: {0}")]
    InvalidPartyId(PartyId),

    /// Message verification failed
    #[error("Message verification failed: {0}")]
    VerificationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Timeout waiting for message
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Input rejected before any round runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid threshold t={t} for n={n}: need 0 < t+1 <= n")]
    InvalidThreshold { t: usize, n: usize },

    #[error("malformed digest: {0}")]
    MalformedDigest(String),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("party {0} is listed more than once")]
    DuplicateParty(PartyId),

    #[error("party {0} is not an eligible signer")]
    IneligibleParty(PartyId),

    #[error("no key material for party {0}")]
    MissingKeyMaterial(PartyId),

    #[error("key material mismatch: {0}")]
    KeyMaterialMismatch(String),

    #[error("no local party given")]
    NoLocalParties,

    #[error("local party {0} is not a member of the session")]
    NotInSession(PartyId),
}

/// Failure of the opaque engine for one party. Always fatal to the session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine rejected the context: {0}")]
    Rejected(String),

    #[error("round did not complete within {0:?}")]
    Timeout(Duration),

    #[error("engine produced an artifact before the terminal round")]
    PrematureArtifact,

    #[error("terminal round produced no artifact")]
    MissingArtifact,

    #[error("engine produced the wrong kind of artifact")]
    WrongArtifact,

    #[error("context belongs to a different session or party")]
    ForeignContext,

    #[error(transparent)]
    Protocol(#[from] Error),
}

/// Failure of a best-effort custody/audit notification
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("custody service answered with status {0}")]
    Status(u16),

    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Where in a party's schedule a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Context creation, before the first round
    Setup,
    /// A numbered protocol round
    Round(u32),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Setup => write!(f, "setup"),
            Stage::Round(round) => write!(f, "round {}", round),
        }
    }
}

/// Session-level failure surfaced to the caller of the coordinator
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("insufficient participants: required {required}, got {available}")]
    InsufficientParticipants { required: usize, available: usize },

    #[error("party {party} failed at {stage}: {source}")]
    Engine {
        party: PartyId,
        stage: Stage,
        #[source]
        source: EngineError,
    },

    #[error("session cancelled")]
    Cancelled,

    #[error("parties disagree on the session result: {0}")]
    InconsistentResults(String),

    #[error("party task aborted: {0}")]
    Task(String),
}

impl SessionError {
    /// True for failures raised by the engine (including round timeouts)
    pub fn is_engine_error(&self) -> bool {
        matches!(self, SessionError::Engine { .. })
    }
}
