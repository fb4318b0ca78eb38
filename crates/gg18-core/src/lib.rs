//! # GG18 Core
//!
//! Round orchestration for GG18 threshold ECDSA.
//!
//! This crate drives (t, n) distributed key generation and threshold signing
//! sessions on top of an opaque round-advancing engine:
//! - [`RoundDriver`] walks one party through keygen rounds 1-5 or signing
//!   rounds 0-9 in strict order
//! - [`SessionCoordinator`] runs all local parties concurrently and aggregates
//!   their results, all-or-nothing
//! - [`ThresholdSelector`] fixes the signer subset
//! - [`ExternalSync`] is a best-effort custody side channel
//!
//! [`LocalEngine`] is a reference engine running the round schedule over a
//! [`mpc::Relay`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use gg18_core::{CoordinatorConfig, LocalEngine, MemoryRelay, MessageDigest,
//!     SessionCoordinator, ThresholdConfig};
//!
//! let relay = Arc::new(MemoryRelay::new());
//! let engine = Arc::new(LocalEngine::new(relay));
//! let coordinator = SessionCoordinator::new(CoordinatorConfig::new("memory://local"), engine);
//!
//! let config = ThresholdConfig::new(1, 3)?;
//! let keygen = coordinator.run_keygen(config).await?;
//!
//! let digest = MessageDigest::keccak256(b"Hello Eigen");
//! let signed = coordinator.run_sign(config, digest, &[0, 1], &keygen.key_materials).await?;
//! ```

pub mod context;
pub mod coordinator;
pub mod driver;
pub mod engine;
pub mod error;
pub mod mpc;
pub mod selector;
pub mod sync;
pub mod types;

pub use context::{Artifact, PartyContext, RoundOutput};
pub use coordinator::{CoordinatorConfig, KeygenOutcome, SessionCoordinator, SignOutcome};
pub use driver::{DriverPlan, RoundDriver, RoundEvent, RoundOutcome};
pub use engine::{ContextParams, LocalEngine, MpcEngine, SessionKind};
pub use error::{ConfigError, EngineError, Error, Result, SessionError, Stage, SyncError};
pub use mpc::{MemoryRelay, Relay};
pub use selector::{SignerSet, ThresholdSelector};
pub use sync::{Checkpoint, CustodyIdentity, ExternalSync, NoopSync, SyncEvent, SyncWarning};
pub use types::{EthAddress, KeyMaterial, MessageDigest, PartyId, SessionId, Signature, ThresholdConfig};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
