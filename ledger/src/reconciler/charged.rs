// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{LedgerError, LedgerResult};
use crate::types::{Donation, DonationId, PledgeId};
use ethers::types::{H256, U256};
use std::collections::{HashMap, VecDeque};

/// Per-pledge queues of donations holding spendable balance, oldest first.
/// Every id in a queue has an entry in the donation map with a non-zero
/// `amount_remaining`.
#[derive(Debug, Default, Clone)]
pub struct ChargedDonations {
    by_pledge: HashMap<PledgeId, VecDeque<DonationId>>,
}

impl ChargedDonations {
    pub fn push(&mut self, pledge: PledgeId, id: DonationId) {
        let queue = self.by_pledge.entry(pledge).or_default();
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    pub fn ids(&self, pledge: PledgeId) -> impl Iterator<Item = DonationId> + '_ {
        self.by_pledge
            .get(&pledge)
            .into_iter()
            .flat_map(|q| q.iter().copied())
    }

    pub fn all_ids(&self) -> impl Iterator<Item = DonationId> + '_ {
        self.by_pledge.values().flat_map(|q| q.iter().copied())
    }

    pub fn balance(&self, pledge: PledgeId, donations: &HashMap<DonationId, Donation>) -> U256 {
        self.ids(pledge)
            .filter_map(|id| donations.get(&id))
            .fold(U256::zero(), |acc, d| acc + d.amount_remaining)
    }

    /// Takes `amount` out of `pledge`'s queue and returns how much came from
    /// each donation. The caller checks the balance first.
    ///
    /// If the newest entry was charged by the same transaction and covers the
    /// whole amount it is spent first, otherwise entries are spent oldest
    /// first.
    pub fn consume(
        &mut self,
        pledge: PledgeId,
        amount: U256,
        tx_hash: H256,
        donations: &mut HashMap<DonationId, Donation>,
    ) -> LedgerResult<Vec<(DonationId, U256)>> {
        let queue = self.by_pledge.entry(pledge).or_default();
        if amount.is_zero() {
            return Ok(vec![]);
        }

        if let Some(&last) = queue.back() {
            let donation = donation_mut(donations, last)?;
            if donation.tx_hash == tx_hash && donation.amount_remaining >= amount {
                donation.amount_remaining -= amount;
                if donation.amount_remaining.is_zero() {
                    queue.pop_back();
                }
                return Ok(vec![(last, amount)]);
            }
        }

        let mut left = amount;
        let mut used = vec![];
        while !left.is_zero() {
            let Some(&front) = queue.front() else {
                return Err(LedgerError::InsufficientBalance {
                    pledge,
                    needed: amount,
                    available: amount - left,
                    tx_hash,
                });
            };
            let donation = donation_mut(donations, front)?;
            let take = donation.amount_remaining.min(left);
            donation.amount_remaining -= take;
            left -= take;
            if donation.amount_remaining.is_zero() {
                queue.pop_front();
            }
            if !take.is_zero() {
                used.push((front, take));
            }
        }
        Ok(used)
    }
}

fn donation_mut(
    donations: &mut HashMap<DonationId, Donation>,
    id: DonationId,
) -> LedgerResult<&mut Donation> {
    donations
        .get_mut(&id)
        .ok_or_else(|| LedgerError::Storage(format!("charged donation {} is not loaded", id)))
}
