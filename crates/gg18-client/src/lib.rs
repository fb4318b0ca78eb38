//! # GG18 Client
//!
//! HTTP plumbing for GG18 sessions:
//! - [`RelayClient`] implements [`gg18_core::Relay`] against `sm-relay-svc`
//! - [`HttpCustodySync`] forwards round checkpoints to custody services

pub mod custody;
pub mod relay;

pub use custody::HttpCustodySync;
pub use relay::RelayClient;
