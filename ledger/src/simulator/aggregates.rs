// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Donation counters of owning entities.

use crate::rates::TokenRegistry;
use crate::types::{Donation, DonationCounter, DonationId, DonationStatus, Entity};
use ethers::types::{Address, U256};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Statuses never counted toward an entity's totals.
const EXCLUDED_STATUSES: [DonationStatus; 4] = [
    DonationStatus::Failed,
    DonationStatus::Rejected,
    DonationStatus::Canceled,
    DonationStatus::Pending,
];

pub fn counts_toward_totals(donation: &Donation) -> bool {
    !donation.is_return && !EXCLUDED_STATUSES.contains(&donation.status)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityAggregate {
    pub counters: BTreeMap<String, DonationCounter>,
    pub people_count: u64,
    pub fully_funded: bool,
}

impl EntityAggregate {
    /// Writes the aggregate into `entity`. Returns whether anything changed.
    pub fn apply_to(&self, entity: &mut Entity) -> bool {
        let changed = entity.counters != self.counters
            || entity.people_count != self.people_count
            || entity.fully_funded != self.fully_funded;
        entity.counters = self.counters.clone();
        entity.people_count = self.people_count;
        entity.fully_funded = self.fully_funded;
        changed
    }
}

fn owned_by(entity: &Entity, donation: &Donation) -> bool {
    donation.owner_type == entity.kind
        && (donation.owner_type_id.as_deref() == Some(entity.id.as_str())
            || entity.admin_id == Some(donation.owner_id))
}

/// Recomputes counters from every donation owned by `entity`, grouped by
/// token symbol. A donation funded by another donation of the same entity
/// is a move inside the entity and is not counted as donated again.
pub fn aggregate_entity(
    entity: &Entity,
    donations: &[Donation],
    tokens: &TokenRegistry,
) -> EntityAggregate {
    let by_id: HashMap<DonationId, &Donation> = donations.iter().map(|d| (d.id, d)).collect();
    let mut counters: BTreeMap<String, DonationCounter> = BTreeMap::new();
    let mut givers: HashSet<Address> = HashSet::new();

    for donation in donations
        .iter()
        .filter(|d| owned_by(entity, d) && counts_toward_totals(d))
    {
        let Some(token) = tokens.get(&donation.token_address) else {
            warn!(
                "[Aggregates] donation {} of {} uses unlisted token {:?}",
                donation.id, entity.id, donation.token_address
            );
            continue;
        };
        let counter = counters
            .entry(token.symbol.clone())
            .or_insert_with(|| DonationCounter {
                symbol: token.symbol.clone(),
                decimals: token.decimals,
                ..Default::default()
            });

        let internal = donation.parent_donations.iter().any(|parent| {
            by_id
                .get(parent)
                .map(|p| owned_by(entity, p))
                .unwrap_or(false)
        });
        if !internal {
            counter.total_donated += donation.amount;
            counter.donation_count += 1;
            givers.extend(donation.giver_address);
        }
        if donation.status != DonationStatus::Paid {
            counter.current_balance += donation.amount_remaining;
        }
    }

    let fully_funded = entity
        .max_amount
        .map(|max| !max.is_zero() && counters.values().any(|c| c.total_donated >= max))
        .unwrap_or(false);
    EntityAggregate {
        counters,
        people_count: givers.len() as u64,
        fully_funded,
    }
}

/// Total still held across every counter.
pub fn total_balance(aggregate: &EntityAggregate) -> U256 {
    aggregate
        .counters
        .values()
        .fold(U256::zero(), |acc, c| acc + c.current_balance)
}
