//! Opaque per-party protocol state

use crate::engine::SessionKind;
use crate::types::{KeyMaterial, PartyId, SessionId, Signature};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Engine state for one party in one session.
///
/// Not `Clone`: every round call consumes the context and hands back a new
/// one. The encoded state carries secret shares and is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PartyContext {
    #[zeroize(skip)]
    kind: SessionKind,
    #[zeroize(skip)]
    session_id: SessionId,
    #[zeroize(skip)]
    party_id: PartyId,
    state: Vec<u8>,
}

impl PartyContext {
    pub fn new(kind: SessionKind, session_id: SessionId, party_id: PartyId, state: Vec<u8>) -> Self {
        Self {
            kind,
            session_id,
            party_id,
            state,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn party_id(&self) -> PartyId {
        self.party_id
    }

    /// Engine-encoded state
    pub fn state(&self) -> &[u8] {
        &self.state
    }
}

impl fmt::Debug for PartyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartyContext")
            .field("kind", &self.kind)
            .field("session_id", &self.session_id)
            .field("party_id", &self.party_id)
            .field("state_len", &self.state.len())
            .finish()
    }
}

/// Final output of a party's terminal round
#[derive(Debug, Clone)]
pub enum Artifact {
    Key(KeyMaterial),
    Signature(Signature),
}

/// What a round call hands back to the driver
#[derive(Debug)]
pub enum RoundOutput {
    /// Context for the next round
    Continue(PartyContext),
    /// Terminal artifact
    Done(Artifact),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroize_wipes_state_only() {
        let session_id = SessionId::new_v4();
        let mut ctx = PartyContext::new(SessionKind::Sign, session_id, 2, b"{\"share\":\"2a\"}".to_vec());
        assert!(!ctx.state().is_empty());

        ctx.zeroize();
        assert!(ctx.state().is_empty());
        assert_eq!(ctx.kind(), SessionKind::Sign);
        assert_eq!(ctx.session_id(), session_id);
        assert_eq!(ctx.party_id(), 2);
        assert!(format!("{:?}", ctx).contains("state_len: 0"));
    }
}
