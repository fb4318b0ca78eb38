//! Signing rounds 0-9
//!
//! | round | action                                   |
//! |-------|------------------------------------------|
//! | 0     | announce the joint public key            |
//! | 1     | commit to Γ_i = γ_i·G                    |
//! | 2     | exchange nonce shares k_i                |
//! | 3     | broadcast δ_i = k·γ_i                    |
//! | 4     | open Γ_i                                 |
//! | 5     | derive R = δ⁻¹·Γ, commit to s_i          |
//! | 6     | cross-check R                            |
//! | 7     | open s_i                                 |
//! | 8     | assemble and verify s, broadcast result  |
//! | 9     | cross-check results, emit the signature  |

use super::{
    check_opening, check_senders, commit_hash, decode_point, encode_point, scalar_from_bytes,
    scalar_to_bytes, SignAnnounce, SignCommit, SignDecommit, SignDelta, SignNonceShare,
    SignRCheck, SignResult, Step,
};
use crate::context::Artifact;
use crate::engine::ContextParams;
use crate::mpc::Relay;
use crate::types::{KeyMaterial, MessageDigest, Signature, ThresholdConfig};
use crate::{Error, PartyId, Result, SessionId};
use k256::{
    elliptic_curve::{scalar::IsHigh, sec1::ToEncodedPoint, Field},
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

/// Per-signer state carried inside the context
#[derive(Serialize, Deserialize)]
pub(crate) struct SignState {
    session_id: SessionId,
    party_id: PartyId,
    config: ThresholdConfig,
    pub(crate) next_round: u32,
    digest: [u8; 32],
    signers: Vec<PartyId>,
    /// Secret key share x_i
    share: [u8; 32],
    public_key: Vec<u8>,
    k_share: [u8; 32],
    gamma_share: [u8; 32],
    gamma_blind: [u8; 32],
    gamma_commits: Vec<[u8; 32]>,
    k: Option<[u8; 32]>,
    delta: Option<[u8; 32]>,
    r_point: Vec<u8>,
    s_share: Option<[u8; 32]>,
    s_blind: [u8; 32],
    s_commits: Vec<[u8; 32]>,
    result: Option<Signature>,
}

impl Drop for SignState {
    fn drop(&mut self) {
        self.share.zeroize();
        self.k_share.zeroize();
        self.gamma_share.zeroize();
    }
}

impl SignState {
    pub(crate) fn new(
        params: &ContextParams,
        key: &KeyMaterial,
        digest: &MessageDigest,
        signers: &[PartyId],
    ) -> Result<Self> {
        if key.party_id != params.party_id {
            return Err(Error::InvalidConfig(format!(
                "key material of party {} handed to party {}",
                key.party_id, params.party_id
            )));
        }
        if !signers.contains(&params.party_id) {
            return Err(Error::InvalidPartyId(params.party_id));
        }
        if signers.len() < params.config.signers_required() {
            return Err(Error::InvalidConfig(format!(
                "{} signers cannot meet threshold {}",
                signers.len(),
                params.config
            )));
        }
        let share: [u8; 32] = key
            .share
            .as_slice()
            .try_into()
            .map_err(|_| Error::Deserialization("Invalid key share length".into()))?;

        let mut signers = signers.to_vec();
        signers.sort_unstable();

        Ok(Self {
            session_id: params.session_id,
            party_id: params.party_id,
            config: params.config,
            next_round: 0,
            digest: *digest.as_bytes(),
            signers,
            share,
            public_key: key.public_key.clone(),
            k_share: [0u8; 32],
            gamma_share: [0u8; 32],
            gamma_blind: [0u8; 32],
            gamma_commits: Vec::new(),
            k: None,
            delta: None,
            r_point: Vec::new(),
            s_share: None,
            s_blind: [0u8; 32],
            s_commits: Vec::new(),
            result: None,
        })
    }

    fn others(&self) -> Vec<PartyId> {
        self.signers
            .iter()
            .copied()
            .filter(|p| *p != self.party_id)
            .collect()
    }

    fn gamma_point(&self) -> Vec<u8> {
        encode_point(&(ProjectivePoint::GENERATOR * scalar_from_bytes(&self.gamma_share)))
    }
}

pub(crate) async fn advance<R: Relay>(
    relay: &R,
    mut state: SignState,
    round: u32,
) -> Result<Step<SignState>> {
    match round {
        0 => round0(relay, &mut state).await?,
        1 => round1(relay, &mut state).await?,
        2 => round2(relay, &mut state).await?,
        3 => round3(relay, &mut state).await?,
        4 => round4(relay, &mut state).await?,
        5 => round5(relay, &mut state).await?,
        6 => round6(relay, &mut state).await?,
        7 => round7(relay, &mut state).await?,
        8 => round8(relay, &mut state).await?,
        9 => return round9(relay, &state).await.map(Step::Finished),
        other => {
            return Err(Error::InvalidConfig(format!(
                "signing has no round {}",
                other
            )))
        }
    }
    state.next_round = round + 1;
    Ok(Step::Next(state))
}

/// Everybody must be signing with the same joint key
async fn round0<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let msg = SignAnnounce {
        party_id: state.party_id,
        public_key: state.public_key.clone(),
    };
    relay.broadcast(&state.session_id, 0, state.party_id, &msg).await?;

    let announced: Vec<SignAnnounce> = relay
        .collect_broadcasts(&state.session_id, 0, &state.signers)
        .await?;
    let senders: Vec<PartyId> = announced.iter().map(|m| m.party_id).collect();
    check_senders(&state.signers, &senders)?;

    if let Some(other) = announced.iter().find(|m| m.public_key != state.public_key) {
        return Err(Error::VerificationFailed(format!(
            "Party {} signs for a different public key",
            other.party_id
        )));
    }

    let mut rng = OsRng;
    state.k_share = scalar_to_bytes(&Scalar::random(&mut rng));
    state.gamma_share = scalar_to_bytes(&Scalar::random(&mut rng));
    Ok(())
}

async fn round1<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    state.gamma_blind = rand::random();
    let hash = commit_hash(&state.gamma_blind, &[&state.gamma_point()]);
    let msg = SignCommit {
        party_id: state.party_id,
        hash,
    };
    relay.broadcast(&state.session_id, 1, state.party_id, &msg).await?;

    let commits: Vec<SignCommit> = relay
        .collect_broadcasts(&state.session_id, 1, &state.signers)
        .await?;
    state.gamma_commits = commits.into_iter().map(|m| m.hash).collect();
    Ok(())
}

/// Nonce shares travel in the clear between co-signers
async fn round2<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let others = state.others();
    for to in &others {
        let msg = SignNonceShare {
            from: state.party_id,
            to: *to,
            k_share: state.k_share,
        };
        relay.send_direct(&state.session_id, 2, state.party_id, *to, &msg).await?;
    }

    let received: Vec<SignNonceShare> = relay
        .collect_direct(&state.session_id, 2, state.party_id, &others)
        .await?;
    let senders: Vec<PartyId> = received.iter().map(|m| m.from).collect();
    check_senders(&others, &senders)?;

    let k = received
        .iter()
        .map(|m| scalar_from_bytes(&m.k_share))
        .fold(scalar_from_bytes(&state.k_share), |acc, k_j| acc + k_j);
    state.k = Some(scalar_to_bytes(&k));
    Ok(())
}

async fn round3<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let k = scalar_from_bytes(&required(state.k, "nonce")?);
    let delta_share = k * scalar_from_bytes(&state.gamma_share);
    let msg = SignDelta {
        party_id: state.party_id,
        delta_share: scalar_to_bytes(&delta_share),
    };
    relay.broadcast(&state.session_id, 3, state.party_id, &msg).await?;

    let deltas: Vec<SignDelta> = relay
        .collect_broadcasts(&state.session_id, 3, &state.signers)
        .await?;
    let delta = deltas
        .iter()
        .map(|m| scalar_from_bytes(&m.delta_share))
        .fold(Scalar::ZERO, |acc, d| acc + d);
    if bool::from(delta.is_zero()) {
        return Err(Error::Crypto("delta is zero".into()));
    }
    state.delta = Some(scalar_to_bytes(&delta));
    Ok(())
}

/// Open Γ_i, check openings and derive R = δ⁻¹·Γ
async fn round4<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let msg = SignDecommit {
        party_id: state.party_id,
        blind: state.gamma_blind,
        value: state.gamma_point(),
    };
    relay.broadcast(&state.session_id, 4, state.party_id, &msg).await?;

    let openings: Vec<SignDecommit> = relay
        .collect_broadcasts(&state.session_id, 4, &state.signers)
        .await?;

    let mut gamma = ProjectivePoint::IDENTITY;
    for (opening, expected) in openings.iter().zip(&state.gamma_commits) {
        check_opening(opening.party_id, expected, &opening.blind, &[&opening.value])?;
        gamma += decode_point(&opening.value)?;
    }

    let delta = scalar_from_bytes(&required(state.delta, "delta")?);
    let delta_inv = Option::<Scalar>::from(delta.invert())
        .ok_or_else(|| Error::Crypto("delta is not invertible".into()))?;
    let r_point = gamma * delta_inv;
    if r_point == ProjectivePoint::IDENTITY {
        return Err(Error::Crypto("R is the point at infinity".into()));
    }

    state.r_point = encode_point(&r_point);
    debug!(party_id = state.party_id, "Derived R");
    Ok(())
}

/// s_i = m·k_i + r·k·λ_i·x_i, committed before it is revealed
async fn round5<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let (r, _) = r_scalar(&state.r_point)?;
    let m = scalar_from_bytes(&state.digest);
    let k = scalar_from_bytes(&required(state.k, "nonce")?);
    let lambda = lagrange_coefficient(state.party_id, &state.signers)?;
    let sigma = k * lambda * scalar_from_bytes(&state.share);
    let s_share = m * scalar_from_bytes(&state.k_share) + r * sigma;

    state.s_blind = rand::random();
    let s_bytes = scalar_to_bytes(&s_share);
    let msg = SignCommit {
        party_id: state.party_id,
        hash: commit_hash(&state.s_blind, &[&s_bytes]),
    };
    relay.broadcast(&state.session_id, 5, state.party_id, &msg).await?;

    let commits: Vec<SignCommit> = relay
        .collect_broadcasts(&state.session_id, 5, &state.signers)
        .await?;
    state.s_commits = commits.into_iter().map(|m| m.hash).collect();
    state.s_share = Some(s_bytes);
    Ok(())
}

async fn round6<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let msg = SignRCheck {
        party_id: state.party_id,
        r_point: state.r_point.clone(),
    };
    relay.broadcast(&state.session_id, 6, state.party_id, &msg).await?;

    let checks: Vec<SignRCheck> = relay
        .collect_broadcasts(&state.session_id, 6, &state.signers)
        .await?;
    if let Some(other) = checks.iter().find(|m| m.r_point != state.r_point) {
        return Err(Error::VerificationFailed(format!(
            "Party {} derived a different R",
            other.party_id
        )));
    }
    Ok(())
}

async fn round7<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let s_share = required(state.s_share, "signature share")?;
    let msg = SignDecommit {
        party_id: state.party_id,
        blind: state.s_blind,
        value: s_share.to_vec(),
    };
    relay.broadcast(&state.session_id, 7, state.party_id, &msg).await?;

    let openings: Vec<SignDecommit> = relay
        .collect_broadcasts(&state.session_id, 7, &state.signers)
        .await?;

    let mut s = Scalar::ZERO;
    for (opening, expected) in openings.iter().zip(&state.s_commits) {
        check_opening(opening.party_id, expected, &opening.blind, &[&opening.value])?;
        let bytes: [u8; 32] = opening
            .value
            .as_slice()
            .try_into()
            .map_err(|_| Error::Deserialization("Invalid s share length".into()))?;
        s += scalar_from_bytes(&bytes);
    }

    state.s_share = Some(scalar_to_bytes(&s));
    Ok(())
}

/// Normalize s, verify against the joint key and publish the result
async fn round8<R: Relay>(relay: &R, state: &mut SignState) -> Result<()> {
    let s = scalar_from_bytes(&required(state.s_share, "signature")?);
    let signature = assemble_signature(&state.r_point, s)?;

    let digest = MessageDigest::new(state.digest);
    let recovered = signature.recover_public_key(&digest)?;
    if recovered.to_encoded_point(true).as_bytes() != state.public_key.as_slice() {
        return Err(Error::InvalidSignature);
    }

    let msg = SignResult {
        party_id: state.party_id,
        r: signature.r,
        s: signature.s,
        v: signature.v,
    };
    relay.broadcast(&state.session_id, 8, state.party_id, &msg).await?;
    state.result = Some(signature);
    Ok(())
}

async fn round9<R: Relay>(relay: &R, state: &SignState) -> Result<Artifact> {
    let signature = state
        .result
        .ok_or_else(|| Error::InvalidConfig("no signature assembled".into()))?;

    let results: Vec<SignResult> = relay
        .collect_broadcasts(&state.session_id, 8, &state.signers)
        .await?;
    for result in &results {
        if Signature::new(result.r, result.s, result.v) != signature {
            return Err(Error::VerificationFailed(format!(
                "Party {} assembled a different signature",
                result.party_id
            )));
        }
    }

    info!(
        party_id = state.party_id,
        r = hex::encode(signature.r),
        s = hex::encode(signature.s),
        v = signature.v,
        "Signing completed"
    );
    Ok(Artifact::Signature(signature))
}

fn required(value: Option<[u8; 32]>, what: &str) -> Result<[u8; 32]> {
    value.ok_or_else(|| Error::InvalidConfig(format!("{} not available yet", what)))
}

/// r = x(R) mod n, along with the raw x coordinate
fn r_scalar(r_point: &[u8]) -> Result<(Scalar, [u8; 32])> {
    let point = decode_point(r_point)?.to_affine();
    let encoded = point.to_encoded_point(false);
    let x: [u8; 32] = encoded.as_bytes()[1..33]
        .try_into()
        .map_err(|_| Error::Crypto("Invalid R coordinate".into()))?;
    Ok((scalar_from_bytes(&x), x))
}

/// Build (r, s, v) with low-s and the matching recovery id
fn assemble_signature(r_point: &[u8], s: Scalar) -> Result<Signature> {
    let (r, x) = r_scalar(r_point)?;
    if bool::from(r.is_zero()) || bool::from(s.is_zero()) {
        return Err(Error::InvalidSignature);
    }

    let compressed = decode_point(r_point)?.to_affine().to_encoded_point(true);
    let mut v = u8::from(compressed.as_bytes()[0] == 0x03);
    if scalar_to_bytes(&r) != x {
        v |= 2;
    }

    let s = if bool::from(s.is_high()) {
        v ^= 1;
        -s
    } else {
        s
    };

    Ok(Signature::new(scalar_to_bytes(&r), scalar_to_bytes(&s), v))
}

/// Lagrange coefficient for `party_id` over the signer set, evaluated at 0
fn lagrange_coefficient(party_id: PartyId, signers: &[PartyId]) -> Result<Scalar> {
    let mut sorted = signers.to_vec();
    sorted.sort_unstable();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::InvalidConfig("duplicate signer index".into()));
    }

    let i = party_id as u64 + 1;
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &j_id in signers {
        let j = j_id as u64 + 1;
        if j != i {
            numerator *= Scalar::from(j);
            denominator *= Scalar::from(j) - Scalar::from(i);
        }
    }

    let inverse = Option::<Scalar>::from(denominator.invert())
        .ok_or_else(|| Error::Crypto("Lagrange denominator is not invertible".into()))?;
    Ok(numerator * inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lagrange_interpolates_constant_term() {
        // f(x) = 5 + 3x, shares at x = 1, 3 (party ids 0 and 2)
        let f = |x: u64| Scalar::from(5u64) + Scalar::from(3u64) * Scalar::from(x);
        let signers = [0, 2];
        let secret = lagrange_coefficient(0, &signers).unwrap() * f(1)
            + lagrange_coefficient(2, &signers).unwrap() * f(3);
        assert_eq!(secret, Scalar::from(5u64));
    }

    #[test]
    fn test_lagrange_rejects_duplicates() {
        assert!(lagrange_coefficient(0, &[0, 1, 1]).is_err());
    }

    #[test]
    fn test_assembled_signature_is_low_s_and_recoverable() {
        let x = Scalar::from(0x1234_5678u64);
        let public_key = ProjectivePoint::GENERATOR * x;
        let digest = MessageDigest::keccak256(b"Hello Eigen");
        let m = scalar_from_bytes(digest.as_bytes());

        // R = k^-1 G, s = k (m + r x)
        let k = Scalar::from(0xdead_beefu64);
        let k_inv = Option::<Scalar>::from(k.invert()).unwrap();
        let r_point = encode_point(&(ProjectivePoint::GENERATOR * k_inv));
        let (r, _) = r_scalar(&r_point).unwrap();
        let signature = assemble_signature(&r_point, k * (m + r * x)).unwrap();

        assert!(!bool::from(scalar_from_bytes(&signature.s).is_high()));
        let recovered = signature.recover_public_key(&digest).unwrap();
        assert_eq!(
            recovered.to_encoded_point(true).as_bytes(),
            encode_point(&public_key).as_slice()
        );
    }
}
