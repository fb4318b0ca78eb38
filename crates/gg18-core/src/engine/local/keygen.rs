//! Keygen rounds 1-5: commit, decommit, share, verify, finish

use super::{
    check_opening, check_senders, commit_hash, decode_point, encode_point, scalar_from_bytes,
    scalar_to_bytes, KeygenCommit, KeygenDecommit, KeygenPublicShare, KeygenShare, Step,
};
use crate::context::Artifact;
use crate::engine::ContextParams;
use crate::mpc::Relay;
use crate::types::{EthAddress, KeyMaterial, ThresholdConfig};
use crate::{Error, PartyId, Result, SessionId};
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

/// Per-party keygen state carried inside the context
#[derive(Serialize, Deserialize)]
pub(crate) struct KeygenState {
    session_id: SessionId,
    party_id: PartyId,
    config: ThresholdConfig,
    pub(crate) next_round: u32,
    /// Polynomial coefficients c_0..c_t
    coefficients: Vec<[u8; 32]>,
    /// Feldman commitments c_k * G
    commitments: Vec<Vec<u8>>,
    blind: [u8; 32],
    commit_hashes: Vec<[u8; 32]>,
    all_commitments: Vec<Vec<Vec<u8>>>,
    received_shares: Vec<[u8; 32]>,
    secret_share: Option<[u8; 32]>,
    public_shares: Vec<Vec<u8>>,
}

impl Drop for KeygenState {
    fn drop(&mut self) {
        self.coefficients.zeroize();
        self.received_shares.zeroize();
        self.secret_share.zeroize();
    }
}

impl KeygenState {
    pub(crate) fn new(params: &ContextParams) -> Result<Self> {
        if params.party_id >= params.config.parties() {
            return Err(Error::InvalidPartyId(params.party_id));
        }
        Ok(Self {
            session_id: params.session_id,
            party_id: params.party_id,
            config: params.config,
            next_round: 1,
            coefficients: Vec::new(),
            commitments: Vec::new(),
            blind: [0u8; 32],
            commit_hashes: Vec::new(),
            all_commitments: Vec::new(),
            received_shares: Vec::new(),
            secret_share: None,
            public_shares: Vec::new(),
        })
    }

    fn parties(&self) -> Vec<PartyId> {
        (0..self.config.parties()).collect()
    }

    fn others(&self) -> Vec<PartyId> {
        self.parties()
            .into_iter()
            .filter(|p| *p != self.party_id)
            .collect()
    }

    fn coefficients(&self) -> Vec<Scalar> {
        self.coefficients.iter().map(scalar_from_bytes).collect()
    }
}

pub(crate) async fn advance<R: Relay>(
    relay: &R,
    mut state: KeygenState,
    round: u32,
) -> Result<Step<KeygenState>> {
    match round {
        1 => round1(relay, &mut state).await?,
        2 => round2(relay, &mut state).await?,
        3 => round3(relay, &mut state).await?,
        4 => round4(relay, &mut state).await?,
        5 => return round5(&state).map(Step::Finished),
        other => {
            return Err(Error::InvalidConfig(format!(
                "keygen has no round {}",
                other
            )))
        }
    }
    state.next_round = round + 1;
    Ok(Step::Next(state))
}

/// Sample the secret polynomial and commit to its Feldman commitments
async fn round1<R: Relay>(relay: &R, state: &mut KeygenState) -> Result<()> {
    let (coefficients, commitments) = generate_secret_polynomial(&state.config);
    let blind: [u8; 32] = rand::random();
    let parts: Vec<&[u8]> = commitments.iter().map(Vec::as_slice).collect();
    let hash = commit_hash(&blind, &parts);

    let msg = KeygenCommit {
        party_id: state.party_id,
        hash,
    };
    relay.broadcast(&state.session_id, 1, state.party_id, &msg).await?;

    let parties = state.parties();
    let commits: Vec<KeygenCommit> = relay.collect_broadcasts(&state.session_id, 1, &parties).await?;
    let senders: Vec<PartyId> = commits.iter().map(|m| m.party_id).collect();
    check_senders(&parties, &senders)?;

    state.coefficients = coefficients.iter().map(scalar_to_bytes).collect();
    state.commitments = commitments;
    state.blind = blind;
    state.commit_hashes = commits.into_iter().map(|m| m.hash).collect();
    Ok(())
}

/// Open the commitment and check everybody else's
async fn round2<R: Relay>(relay: &R, state: &mut KeygenState) -> Result<()> {
    let msg = KeygenDecommit {
        party_id: state.party_id,
        blind: state.blind,
        commitments: state.commitments.clone(),
    };
    relay.broadcast(&state.session_id, 2, state.party_id, &msg).await?;

    let parties = state.parties();
    let openings: Vec<KeygenDecommit> =
        relay.collect_broadcasts(&state.session_id, 2, &parties).await?;

    let degree_plus_one = state.config.threshold() + 1;
    for (opening, expected) in openings.iter().zip(&state.commit_hashes) {
        if opening.commitments.len() != degree_plus_one {
            return Err(Error::VerificationFailed(format!(
                "Party {} committed to {} coefficients, expected {}",
                opening.party_id,
                opening.commitments.len(),
                degree_plus_one
            )));
        }
        let parts: Vec<&[u8]> = opening.commitments.iter().map(Vec::as_slice).collect();
        check_opening(opening.party_id, expected, &opening.blind, &parts)?;
    }

    state.all_commitments = openings.into_iter().map(|m| m.commitments).collect();
    Ok(())
}

/// Send f_i(j) to every other party
async fn round3<R: Relay>(relay: &R, state: &mut KeygenState) -> Result<()> {
    let coefficients = state.coefficients();
    for to in state.others() {
        let share = evaluate_polynomial(&coefficients, to as u64 + 1);
        let msg = KeygenShare {
            from: state.party_id,
            to,
            share: scalar_to_bytes(&share),
        };
        relay.send_direct(&state.session_id, 3, state.party_id, to, &msg).await?;
    }

    let others = state.others();
    let received: Vec<KeygenShare> = relay
        .collect_direct(&state.session_id, 3, state.party_id, &others)
        .await?;
    let senders: Vec<PartyId> = received.iter().map(|m| m.from).collect();
    check_senders(&others, &senders)?;

    state.received_shares = received.into_iter().map(|m| m.share).collect();
    Ok(())
}

/// Verify received shares, fix the secret share and publish x_i * G
async fn round4<R: Relay>(relay: &R, state: &mut KeygenState) -> Result<()> {
    let others = state.others();
    for (from, share) in others.iter().zip(&state.received_shares) {
        verify_share(*from, share, &state.all_commitments[*from], state.party_id)?;
    }

    let own = evaluate_polynomial(&state.coefficients(), state.party_id as u64 + 1);
    let secret = state
        .received_shares
        .iter()
        .map(scalar_from_bytes)
        .fold(own, |acc, share| acc + share);
    let public_share = encode_point(&(ProjectivePoint::GENERATOR * secret));

    let msg = KeygenPublicShare {
        party_id: state.party_id,
        public_share,
    };
    relay.broadcast(&state.session_id, 4, state.party_id, &msg).await?;

    let parties = state.parties();
    let published: Vec<KeygenPublicShare> =
        relay.collect_broadcasts(&state.session_id, 4, &parties).await?;

    state.secret_share = Some(scalar_to_bytes(&secret));
    state.public_shares = published.into_iter().map(|m| m.public_share).collect();
    // The polynomial is no longer needed
    state.coefficients.clear();
    Ok(())
}

/// Cross-check the published public shares and emit the key material
fn round5(state: &KeygenState) -> Result<Artifact> {
    let expected = compute_public_shares(&state.all_commitments, state.config.parties())?;
    for (party_id, (published, expected)) in state.public_shares.iter().zip(&expected).enumerate() {
        if published != expected {
            return Err(Error::VerificationFailed(format!(
                "Public share of party {} does not match the commitments",
                party_id
            )));
        }
    }

    let secret_share = state
        .secret_share
        .ok_or_else(|| Error::InvalidConfig("keygen finished without a secret share".into()))?;
    let public_key = compute_public_key(&state.all_commitments)?;
    let address = EthAddress::from_sec1_bytes(&public_key)?;

    info!(
        party_id = state.party_id,
        public_key = hex::encode(&public_key),
        %address,
        "Keygen completed"
    );

    Ok(Artifact::Key(KeyMaterial {
        keygen_session: state.session_id,
        party_id: state.party_id,
        config: state.config,
        share: secret_share.to_vec(),
        public_key,
        public_shares: expected,
        address,
    }))
}

/// Generate a random secret polynomial of degree t
fn generate_secret_polynomial(config: &ThresholdConfig) -> (Vec<Scalar>, Vec<Vec<u8>>) {
    let mut rng = OsRng;
    let degree_plus_one = config.threshold() + 1;
    let mut coefficients = Vec::with_capacity(degree_plus_one);
    let mut commitments = Vec::with_capacity(degree_plus_one);

    for _ in 0..degree_plus_one {
        let coef = Scalar::random(&mut rng);
        commitments.push(encode_point(&(ProjectivePoint::GENERATOR * coef)));
        coefficients.push(coef);
    }

    debug!(degree = config.threshold(), "Sampled secret polynomial");
    (coefficients, commitments)
}

/// Evaluate polynomial at a point
fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coef in coefficients {
        result += *coef * x_power;
        x_power *= x_scalar;
    }

    result
}

/// Evaluate the committed polynomial "in the exponent" at x
fn evaluate_commitments(commitments: &[Vec<u8>], x: u64) -> Result<ProjectivePoint> {
    let x_scalar = Scalar::from(x);
    let mut x_power = Scalar::ONE;
    let mut acc = ProjectivePoint::IDENTITY;

    for commitment in commitments {
        acc += decode_point(commitment)? * x_power;
        x_power *= x_scalar;
    }

    Ok(acc)
}

/// Verify a share against the sender's commitments
fn verify_share(from: PartyId, share: &[u8; 32], commitments: &[Vec<u8>], my_id: PartyId) -> Result<()> {
    let expected = ProjectivePoint::GENERATOR * scalar_from_bytes(share);
    let actual = evaluate_commitments(commitments, my_id as u64 + 1)?;

    if expected != actual {
        return Err(Error::VerificationFailed(format!(
            "Share from party {} does not match commitment",
            from
        )));
    }

    Ok(())
}

/// Sum of every party's constant-term commitment
fn compute_public_key(all_commitments: &[Vec<Vec<u8>>]) -> Result<Vec<u8>> {
    let mut public_key = ProjectivePoint::IDENTITY;

    for commitments in all_commitments {
        let first = commitments
            .first()
            .ok_or_else(|| Error::VerificationFailed("Empty commitments".into()))?;
        public_key += decode_point(first)?;
    }

    Ok(encode_point(&public_key))
}

/// Expected x_j * G for every party j
fn compute_public_shares(all_commitments: &[Vec<Vec<u8>>], n_parties: usize) -> Result<Vec<Vec<u8>>> {
    let mut public_shares = Vec::with_capacity(n_parties);

    for party_id in 0..n_parties {
        let mut public_share = ProjectivePoint::IDENTITY;
        for commitments in all_commitments {
            public_share += evaluate_commitments(commitments, party_id as u64 + 1)?;
        }
        public_shares.push(encode_point(&public_share));
    }

    Ok(public_shares)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polynomial_evaluation() {
        // f(x) = 3 + 2x
        let coefficients = vec![Scalar::from(3u64), Scalar::from(2u64)];
        assert_eq!(evaluate_polynomial(&coefficients, 0), Scalar::from(3u64));
        assert_eq!(evaluate_polynomial(&coefficients, 4), Scalar::from(11u64));
    }

    #[test]
    fn test_share_verification() {
        let config = ThresholdConfig::new(1, 3).unwrap();
        let (coefficients, commitments) = generate_secret_polynomial(&config);

        let share = scalar_to_bytes(&evaluate_polynomial(&coefficients, 3));
        assert!(verify_share(0, &share, &commitments, 2).is_ok());
        assert!(verify_share(0, &share, &commitments, 1).is_err());
    }
}
