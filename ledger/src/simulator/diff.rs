// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::{Donation, DonationId, DonationStatus};
use ethers::types::U256;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationMismatch {
    pub id: DonationId,
    pub stored_remaining: U256,
    pub replayed_remaining: U256,
    pub stored_status: DonationStatus,
    pub replayed_status: DonationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDiff {
    /// Persisted donations no replayed transfer accounted for.
    pub orphans: Vec<DonationId>,
    pub mismatches: Vec<DonationMismatch>,
    /// Donations the replay produced that the store does not hold.
    pub missing: Vec<DonationId>,
}

impl LedgerDiff {
    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty() && self.mismatches.is_empty() && self.missing.is_empty()
    }
}

/// Compares the persisted donations against a replay. `used` holds the
/// persisted ids the replay matched.
pub fn diff_donations(
    persisted: &[Donation],
    replayed: &[Donation],
    used: &HashSet<DonationId>,
) -> LedgerDiff {
    let replayed: BTreeMap<DonationId, &Donation> = replayed.iter().map(|d| (d.id, d)).collect();
    let stored_ids: HashSet<DonationId> = persisted.iter().map(|d| d.id).collect();
    let mut diff = LedgerDiff::default();

    let mut persisted: Vec<&Donation> = persisted.iter().collect();
    persisted.sort_by_key(|d| d.id);
    for stored in persisted {
        let replay = match replayed.get(&stored.id) {
            Some(replay) if used.contains(&stored.id) => replay,
            _ => {
                diff.orphans.push(stored.id);
                continue;
            }
        };
        if stored.amount_remaining != replay.amount_remaining || stored.status != replay.status {
            diff.mismatches.push(DonationMismatch {
                id: stored.id,
                stored_remaining: stored.amount_remaining,
                replayed_remaining: replay.amount_remaining,
                stored_status: stored.status,
                replayed_status: replay.status,
            });
        }
    }
    diff.missing = replayed
        .keys()
        .filter(|id| !stored_ids.contains(id))
        .copied()
        .collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::donation;

    #[test]
    fn test_diff_classifies_orphans_mismatches_and_missing() {
        let persisted = vec![
            donation(1, Some(1), 100, 100, DonationStatus::Waiting),
            donation(2, Some(2), 50, 50, DonationStatus::Committed),
            donation(3, Some(3), 10, 10, DonationStatus::Committed),
        ];
        let replayed = vec![
            donation(1, Some(1), 100, 100, DonationStatus::Waiting),
            donation(2, Some(2), 50, 0, DonationStatus::Committed),
            // seeded but never matched
            donation(3, Some(3), 10, 0, DonationStatus::Committed),
            donation(4, Some(4), 50, 50, DonationStatus::Committed),
        ];
        let used = HashSet::from([DonationId(1), DonationId(2)]);

        let diff = diff_donations(&persisted, &replayed, &used);
        assert_eq!(diff.orphans, vec![DonationId(3)]);
        assert_eq!(diff.mismatches.len(), 1);
        assert_eq!(diff.mismatches[0].id, DonationId(2));
        assert_eq!(diff.mismatches[0].replayed_remaining, U256::zero());
        assert_eq!(diff.missing, vec![DonationId(4)]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_identical_ledgers_have_no_diff() {
        let donations = vec![donation(1, Some(1), 100, 100, DonationStatus::Waiting)];
        let used = HashSet::from([DonationId(1)]);
        assert!(diff_donations(&donations, &donations, &used).is_empty());
    }
}
