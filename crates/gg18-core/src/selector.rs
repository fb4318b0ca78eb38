//! Deterministic signer subset selection
//!
//! Without an explicit subset the selector takes the t+1 lowest eligible
//! party ids, so every coordinator given the same inputs picks the same
//! signers.

use crate::error::{ConfigError, SessionError};
use crate::types::{PartyId, ThresholdConfig};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Signer subset fixed for one signing session (sorted, no duplicates)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignerSet(Vec<PartyId>);

impl SignerSet {
    pub fn as_slice(&self) -> &[PartyId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, party_id: PartyId) -> bool {
        self.0.binary_search(&party_id).is_ok()
    }

    pub fn into_vec(self) -> Vec<PartyId> {
        self.0
    }
}

impl AsRef<[PartyId]> for SignerSet {
    fn as_ref(&self) -> &[PartyId] {
        &self.0
    }
}

/// Picks the signer subset for a threshold policy
#[derive(Debug, Clone, Copy)]
pub struct ThresholdSelector {
    config: ThresholdConfig,
}

impl ThresholdSelector {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    /// Validate `explicit` against `eligible`, or pick the first t+1 eligible
    /// parties by index
    pub fn select(
        &self,
        eligible: &[PartyId],
        explicit: Option<&[PartyId]>,
    ) -> Result<SignerSet, SessionError> {
        let required = self.config.signers_required();
        let eligible: BTreeSet<PartyId> = eligible
            .iter()
            .copied()
            .filter(|p| *p < self.config.parties())
            .collect();

        let selected: Vec<PartyId> = match explicit {
            Some(subset) => check_subset(self.config, subset, |p| eligible.contains(&p))?,
            None => {
                if eligible.len() < required {
                    return Err(SessionError::InsufficientParticipants {
                        required,
                        available: eligible.len(),
                    });
                }
                eligible.into_iter().take(required).collect()
            }
        };

        debug!(config = %self.config, signers = ?selected, "Selected signers");
        Ok(SignerSet(selected))
    }
}

/// Validate an explicit signer subset: duplicates first, then size, then
/// eligibility. Returns the subset sorted.
pub(crate) fn check_subset(
    config: ThresholdConfig,
    subset: &[PartyId],
    is_eligible: impl Fn(PartyId) -> bool,
) -> Result<Vec<PartyId>, SessionError> {
    let mut unique = BTreeSet::new();
    for party_id in subset {
        if !unique.insert(*party_id) {
            return Err(ConfigError::DuplicateParty(*party_id).into());
        }
    }

    let required = config.signers_required();
    if unique.len() < required {
        return Err(SessionError::InsufficientParticipants {
            required,
            available: unique.len(),
        });
    }

    if let Some(party_id) = unique.iter().find(|p| !is_eligible(**p)) {
        return Err(ConfigError::IneligibleParty(*party_id).into());
    }
    Ok(unique.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(t: usize, n: usize) -> ThresholdSelector {
        ThresholdSelector::new(ThresholdConfig::new(t, n).unwrap())
    }

    #[test]
    fn test_default_picks_lowest_ids() {
        let set = selector(1, 3).select(&[2, 0, 1], None).unwrap();
        assert_eq!(set.as_slice(), &[0, 1]);

        let set = selector(2, 5).select(&[4, 3, 1], None).unwrap();
        assert_eq!(set.as_slice(), &[1, 3, 4]);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let a = selector(2, 5).select(&[0, 1, 2, 3, 4], None).unwrap();
        let b = selector(2, 5).select(&[4, 3, 2, 1, 0], None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_explicit_subset_used_sorted() {
        let set = selector(1, 3).select(&[0, 1, 2], Some(&[2, 0, 1])).unwrap();
        assert_eq!(set.as_slice(), &[0, 1, 2]);
        assert!(set.contains(2));
    }

    #[test]
    fn test_explicit_subset_validation() {
        let sel = selector(1, 3);
        assert!(matches!(
            sel.select(&[0, 1, 2], Some(&[0, 0])),
            Err(SessionError::Config(ConfigError::DuplicateParty(0)))
        ));
        assert!(matches!(
            sel.select(&[0, 1], Some(&[0, 2])),
            Err(SessionError::Config(ConfigError::IneligibleParty(2)))
        ));
        assert!(matches!(
            sel.select(&[0, 1, 2], Some(&[1])),
            Err(SessionError::InsufficientParticipants {
                required: 2,
                available: 1
            })
        ));
    }

    #[test]
    fn test_short_subset_reported_before_eligibility() {
        let sel = selector(1, 3);
        assert!(matches!(
            sel.select(&[0, 1, 2], Some(&[5])),
            Err(SessionError::InsufficientParticipants {
                required: 2,
                available: 1
            })
        ));
        assert!(matches!(
            sel.select(&[0, 1, 2], Some(&[5, 0])),
            Err(SessionError::Config(ConfigError::IneligibleParty(5)))
        ));
    }

    #[test]
    fn test_not_enough_eligible() {
        // Out-of-range ids do not count
        assert!(matches!(
            selector(1, 3).select(&[0, 7], None),
            Err(SessionError::InsufficientParticipants {
                required: 2,
                available: 1
            })
        ));
    }
}
