//! Round messages exchanged through the relay by the local engine

use crate::PartyId;
use serde::{Deserialize, Serialize};

/// Keygen round 1: commitment to the Feldman coefficient commitments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenCommit {
    pub party_id: PartyId,
    pub hash: [u8; 32],
}

/// Keygen round 2: opening of the round 1 commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenDecommit {
    pub party_id: PartyId,
    pub blind: [u8; 32],
    /// Commitments to polynomial coefficients (compressed points)
    pub commitments: Vec<Vec<u8>>,
}

/// Keygen round 3: secret share for one receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenShare {
    pub from: PartyId,
    pub to: PartyId,
    pub share: [u8; 32],
}

/// Keygen round 4: the sender's public key share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenPublicShare {
    pub party_id: PartyId,
    pub public_share: Vec<u8>,
}

/// Sign round 0: which key the signer holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignAnnounce {
    pub party_id: PartyId,
    pub public_key: Vec<u8>,
}

/// Hash commitment used in sign rounds 1 and 5
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignCommit {
    pub party_id: PartyId,
    pub hash: [u8; 32],
}

/// Sign round 2: nonce share for one co-signer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignNonceShare {
    pub from: PartyId,
    pub to: PartyId,
    pub k_share: [u8; 32],
}

/// Sign round 3: additive share of k * gamma
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignDelta {
    pub party_id: PartyId,
    pub delta_share: [u8; 32],
}

/// Opening of a sign commitment (rounds 4 and 7)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignDecommit {
    pub party_id: PartyId,
    pub blind: [u8; 32],
    pub value: Vec<u8>,
}

/// Sign round 6: the R point each signer derived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRCheck {
    pub party_id: PartyId,
    pub r_point: Vec<u8>,
}

/// Sign round 8: the assembled signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResult {
    pub party_id: PartyId,
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}
