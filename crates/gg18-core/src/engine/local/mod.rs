//! Reference engine running the GG18 round schedule over a [`Relay`]
//!
//! Keys and signatures it produces are valid secp256k1 ECDSA material, but the
//! multiplicative-to-additive step of signing is done in the clear between
//! co-signers. It exists to drive the orchestration layer end to end and must
//! not guard real funds.

mod keygen;
mod messages;
mod sign;

use super::{async_trait, ContextParams, MpcEngine, SessionKind};
use crate::context::{Artifact, PartyContext, RoundOutput};
use crate::error::EngineError;
use crate::mpc::Relay;
use crate::types::{KeyMaterial, MessageDigest, PartyId, SessionId};
use crate::{Error, Result};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

pub use messages::*;

/// Result of one engine round on a decoded state
pub(crate) enum Step<S> {
    Next(S),
    Finished(Artifact),
}

/// GG18-schedule engine bound to one relay
pub struct LocalEngine<R> {
    relay: Arc<R>,
}

impl<R: Relay> LocalEngine<R> {
    pub fn new(relay: Arc<R>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<R> {
        &self.relay
    }

    fn check_relay(&self, relay_addr: &str) -> std::result::Result<(), EngineError> {
        let wanted = relay_addr.trim_end_matches('/');
        let bound = self.relay.endpoint().trim_end_matches('/');
        if wanted != bound {
            return Err(EngineError::Rejected(format!(
                "context targets relay {} but the engine is bound to {}",
                wanted, bound
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Relay> MpcEngine for LocalEngine<R> {
    async fn keygen_context(
        &self,
        params: &ContextParams,
    ) -> std::result::Result<PartyContext, EngineError> {
        self.check_relay(&params.relay_addr)?;
        let state = keygen::KeygenState::new(params)?;
        encode_context(SessionKind::Keygen, params, &state)
    }

    async fn sign_context(
        &self,
        params: &ContextParams,
        key: &KeyMaterial,
        digest: &MessageDigest,
        signers: &[PartyId],
    ) -> std::result::Result<PartyContext, EngineError> {
        self.check_relay(&params.relay_addr)?;
        let state = sign::SignState::new(params, key, digest, signers)?;
        encode_context(SessionKind::Sign, params, &state)
    }

    async fn release_session(&self, session_id: &SessionId) {
        self.relay.release_session(session_id).await;
    }

    async fn round(
        &self,
        kind: SessionKind,
        context: PartyContext,
        round: u32,
    ) -> std::result::Result<RoundOutput, EngineError> {
        if context.kind() != kind {
            return Err(EngineError::Rejected(format!(
                "{} context passed to a {} round",
                context.kind(),
                kind
            )));
        }
        let (session_id, party_id) = (context.session_id(), context.party_id());
        debug!(%session_id, party_id, %kind, round, "Engine round");

        let step = match kind {
            SessionKind::Keygen => {
                let state: keygen::KeygenState = decode_state(&context)?;
                expect_round(state.next_round, round)?;
                match keygen::advance(self.relay.as_ref(), state, round).await? {
                    Step::Next(state) => Step::Next(serde_json::to_vec(&state).map_err(Error::from)?),
                    Step::Finished(artifact) => Step::Finished(artifact),
                }
            }
            SessionKind::Sign => {
                let state: sign::SignState = decode_state(&context)?;
                expect_round(state.next_round, round)?;
                match sign::advance(self.relay.as_ref(), state, round).await? {
                    Step::Next(state) => Step::Next(serde_json::to_vec(&state).map_err(Error::from)?),
                    Step::Finished(artifact) => Step::Finished(artifact),
                }
            }
        };

        Ok(match step {
            Step::Next(bytes) => {
                RoundOutput::Continue(PartyContext::new(kind, session_id, party_id, bytes))
            }
            Step::Finished(artifact) => RoundOutput::Done(artifact),
        })
    }
}

fn expect_round(next: u32, requested: u32) -> std::result::Result<(), EngineError> {
    if next != requested {
        return Err(EngineError::Rejected(format!(
            "expected round {}, asked for round {}",
            next, requested
        )));
    }
    Ok(())
}

fn encode_context<S: Serialize>(
    kind: SessionKind,
    params: &ContextParams,
    state: &S,
) -> std::result::Result<PartyContext, EngineError> {
    let bytes = serde_json::to_vec(state).map_err(Error::from)?;
    Ok(PartyContext::new(kind, params.session_id, params.party_id, bytes))
}

fn decode_state<S: DeserializeOwned>(context: &PartyContext) -> Result<S> {
    serde_json::from_slice(context.state()).map_err(|e| Error::Deserialization(e.to_string()))
}

pub(crate) fn scalar_from_bytes(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*bytes).into())
}

pub(crate) fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}

pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::VerificationFailed(e.to_string()))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::VerificationFailed("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// sha256(blind || parts...)
pub(crate) fn commit_hash(blind: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(blind);
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub(crate) fn check_opening(
    party_id: PartyId,
    expected: &[u8; 32],
    blind: &[u8; 32],
    parts: &[&[u8]],
) -> Result<()> {
    let actual = commit_hash(blind, parts);
    if bool::from(actual.ct_eq(expected)) {
        Ok(())
    } else {
        Err(Error::VerificationFailed(format!(
            "Decommitment from party {} does not match its commitment",
            party_id
        )))
    }
}

/// Every collected message must come from the sender at the same position
pub(crate) fn check_senders(expected: &[PartyId], actual: &[PartyId]) -> Result<()> {
    if expected.len() != actual.len() {
        return Err(Error::VerificationFailed(format!(
            "Expected {} messages, got {}",
            expected.len(),
            actual.len()
        )));
    }
    for (want, got) in expected.iter().zip(actual) {
        if want != got {
            return Err(Error::VerificationFailed(format!(
                "Expected a message from party {}, got one from party {}",
                want, got
            )));
        }
    }
    Ok(())
}
