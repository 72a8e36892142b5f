// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Maps pledge-to-pledge transfers onto donation records.
//!
//! ```text
//!   Transfer(from, to, amount, tx)
//!      │
//!      ├─ 1. validate destination (pledge state, owner admin, token)
//!      ├─ 2. return detection against transfers already seen in `tx`
//!      ├─ 3. check charged balance at `from`, fault if short
//!      ├─ 4. reclassify a failed donation matching (tx, amount, from)
//!      ├─ 5. consume from `from` (same-tx tail first, then FIFO)
//!      └─ 6. match a pending record at `to` or create a donation
//! ```
//!
//! All state sits behind one lock, so no two transfers interleave their
//! consume and produce steps.

mod charged;
mod status;


pub use charged::ChargedDonations;
pub use status::derive_status;

use crate::chain_client::PledgeSource;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::LedgerMetrics;
use crate::rates::{usd_value, RateProvider, TokenRegistry};
use crate::store::LedgerStore;
use crate::types::{
    AdminId, AdminType, Donation, DonationId, DonationStatus, EntityKind, EntityStatus, Pledge,
    PledgeAdmin, PledgeId,
};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Transactions whose transfers are kept for return detection.
const TX_BUFFER_CAPACITY: usize = 4096;

/// What to do when the ledger cannot be reconciled with chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Return the fault to the caller, halting the run.
    #[default]
    Strict,
    /// Record the fault, skip the event and keep going.
    Advisory,
    /// Record the fault and stop processing the pledges involved, while
    /// unrelated pledges keep going.
    Isolate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: Option<PledgeId>,
    pub to: PledgeId,
    pub amount: U256,
    pub tx_hash: H256,
    pub block_number: u64,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Applied {
        donation: DonationId,
        /// Matched onto an existing pending record rather than created.
        matched: bool,
        is_return: bool,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerFault {
    pub error_type: &'static str,
    pub message: String,
    pub tx_hash: Option<H256>,
    pub pledges: Vec<PledgeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConservationViolation {
    pub pledge: PledgeId,
    pub expected: U256,
    pub charged: U256,
}

#[derive(Debug, Clone, Copy)]
struct TransferRecord {
    from: Option<PledgeId>,
    to: PledgeId,
}

#[derive(Default)]
struct ReconcilerState {
    charged: ChargedDonations,
    /// Records awaiting their chain event, keyed by the pledge they expect.
    /// `None` holds donations whose transaction failed.
    unmatched: HashMap<Option<PledgeId>, VecDeque<DonationId>>,
    donations: HashMap<DonationId, Donation>,
    tx_transfers: HashMap<H256, Vec<TransferRecord>>,
    tx_order: VecDeque<H256>,
    used: HashSet<DonationId>,
    quarantined: HashSet<PledgeId>,
    faults: Vec<LedgerFault>,
    /// Changed in memory, not yet written to the store.
    unsynced: BTreeSet<DonationId>,
}

impl ReconcilerState {
    fn record_transfer(&mut self, tx_hash: H256, record: TransferRecord) {
        if !self.tx_transfers.contains_key(&tx_hash) {
            self.tx_order.push_back(tx_hash);
            if self.tx_order.len() > TX_BUFFER_CAPACITY {
                if let Some(evicted) = self.tx_order.pop_front() {
                    self.tx_transfers.remove(&evicted);
                }
            }
        }
        self.tx_transfers.entry(tx_hash).or_default().push(record);
    }

    fn index(&mut self, donation: Donation) {
        let id = donation.id;
        match (donation.pledge_id, donation.status) {
            (None, _) => self.unmatched.entry(None).or_default().push_back(id),
            (Some(pledge), _) if !donation.amount_remaining.is_zero() => {
                self.charged.push(pledge, id)
            }
            (Some(pledge), DonationStatus::Pending) => {
                self.unmatched.entry(Some(pledge)).or_default().push_back(id)
            }
            _ => {}
        }
        self.donations.insert(id, donation);
    }
}

/// Destination facts resolved before anything is mutated.
struct Destination {
    pledge: Pledge,
    owner: PledgeAdmin,
    owner_type: EntityKind,
    owner_type_id: Option<String>,
    status: DonationStatus,
    usd_value: Option<f64>,
}

pub struct LedgerReconciler<S, P> {
    store: Arc<S>,
    source: Arc<P>,
    tokens: TokenRegistry,
    rates: Arc<dyn RateProvider>,
    policy: FaultPolicy,
    metrics: Arc<LedgerMetrics>,
    state: Mutex<ReconcilerState>,
}

impl<S: LedgerStore, P: PledgeSource> LedgerReconciler<S, P> {
    pub fn new(
        store: Arc<S>,
        source: Arc<P>,
        tokens: TokenRegistry,
        rates: Arc<dyn RateProvider>,
        policy: FaultPolicy,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            store,
            source,
            tokens,
            rates,
            policy,
            metrics,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Rebuilds charged and pending lists from the persisted donations.
    pub async fn load_from_store(&self) -> LedgerResult<usize> {
        let mut donations = self.store.donations().await?;
        donations.sort_by_key(|d| d.id);
        let count = donations.len();
        let mut state = self.state.lock().await;
        *state = ReconcilerState::default();
        for donation in donations {
            state.index(donation);
        }
        info!("[LedgerReconciler] loaded {} donations from store", count);
        Ok(count)
    }

    /// Registers stored donations as match candidates for a full replay.
    /// Their balances are zeroed; the replay recharges every one it matches.
    pub async fn seed_candidates(&self, candidates: Vec<Donation>) -> LedgerResult<usize> {
        let mut candidates = candidates;
        candidates.sort_by_key(|d| d.id);
        let count = candidates.len();
        let mut state = self.state.lock().await;
        for mut candidate in candidates {
            candidate.amount_remaining = U256::zero();
            let key = if candidate.status == DonationStatus::Failed {
                None
            } else {
                candidate.pledge_id
            };
            state.unmatched.entry(key).or_default().push_back(candidate.id);
            state.donations.insert(candidate.id, candidate.clone());
            self.store.put_donation(candidate).await?;
        }
        Ok(count)
    }

    pub async fn apply_transfer(&self, transfer: &Transfer) -> LedgerResult<TransferOutcome> {
        let mut state = self.state.lock().await;

        if self.policy == FaultPolicy::Isolate {
            let touched: Vec<PledgeId> = transfer.from.into_iter().chain([transfer.to]).collect();
            if let Some(&hit) = touched.iter().find(|p| state.quarantined.contains(p)) {
                return self.fault(&mut state, LedgerError::QuarantinedPledge(hit), transfer);
            }
        }

        match self.apply_transfer_locked(&mut state, transfer).await {
            Err(err) if err.is_ledger_fault() => self.fault(&mut state, err, transfer),
            other => other,
        }
    }

    async fn apply_transfer_locked(
        &self,
        state: &mut ReconcilerState,
        transfer: &Transfer,
    ) -> LedgerResult<TransferOutcome> {
        self.sync_donations(state).await?;
        let destination = self.resolve_destination(transfer).await?;
        let from_pledge = match transfer.from {
            Some(from) => Some(self.source.pledge(from).await?),
            None => None,
        };

        let (is_return, rejected) = self
            .detect_return(state, transfer, from_pledge.as_ref(), &destination)
            .await?;

        if let Some(from) = transfer.from {
            let available = state.charged.balance(from, &state.donations);
            if available < transfer.amount {
                return Err(LedgerError::InsufficientBalance {
                    pledge: from,
                    needed: transfer.amount,
                    available,
                    tx_hash: transfer.tx_hash,
                });
            }
        }

        self.reclassify_failed(state, transfer);

        let mut touched = vec![];
        let mut parents = vec![];
        if let Some(from) = transfer.from {
            let ReconcilerState {
                charged, donations, ..
            } = state;
            for (id, taken) in charged.consume(from, transfer.amount, transfer.tx_hash, donations)? {
                debug!(
                    "[LedgerReconciler] consumed {} from donation {} at pledge {}",
                    taken, id, from
                );
                if !parents.contains(&id) {
                    parents.push(id);
                }
                touched.push(id);
            }
        }
        if rejected {
            for id in &parents {
                if let Some(parent) = state.donations.get_mut(id) {
                    parent.status = DonationStatus::Rejected;
                }
            }
        }

        let giver_address = match parents.first() {
            Some(parent) => state.donations.get(parent).and_then(|d| d.giver_address),
            None if destination.owner.admin_type == AdminType::Giver => {
                Some(destination.owner.address)
            }
            None => None,
        };

        let (donation_id, matched) = match self.take_pending_match(state, transfer) {
            Some(id) => {
                let donation = state.donations.get_mut(&id).ok_or_else(|| {
                    LedgerError::Storage(format!("pending donation {} is not loaded", id))
                })?;
                donation.pledge_id = Some(transfer.to);
                donation.amount_remaining = transfer.amount;
                donation.status = destination.status;
                donation.parent_donations = parents.clone();
                donation.is_return = is_return;
                donation.usd_value = destination.usd_value;
                donation.mined = true;
                donation.owner_id = destination.pledge.owner;
                donation.owner_type = destination.owner_type;
                donation.owner_type_id = destination.owner_type_id.clone();
                if donation.giver_address.is_none() {
                    donation.giver_address = giver_address;
                }
                self.metrics.donations_matched.inc();
                (id, true)
            }
            None => {
                let id = self.store.next_donation_id().await?;
                let donation = Donation {
                    id,
                    pledge_id: Some(transfer.to),
                    amount: transfer.amount,
                    amount_remaining: transfer.amount,
                    status: destination.status,
                    owner_id: destination.pledge.owner,
                    owner_type: destination.owner_type,
                    owner_type_id: destination.owner_type_id.clone(),
                    intended_project_id: destination.pledge.intended_project,
                    delegate_id: destination.pledge.delegates.last().copied(),
                    giver_address,
                    token_address: destination.pledge.token,
                    tx_hash: transfer.tx_hash,
                    parent_donations: parents.clone(),
                    is_return,
                    mined: true,
                    usd_value: destination.usd_value,
                    payment_id: None,
                };
                state.donations.insert(id, donation);
                self.metrics.donations_created.inc();
                (id, false)
            }
        };
        if !transfer.amount.is_zero() {
            state.charged.push(transfer.to, donation_id);
        }
        state.used.insert(donation_id);
        touched.push(donation_id);
        state.record_transfer(
            transfer.tx_hash,
            TransferRecord {
                from: transfer.from,
                to: transfer.to,
            },
        );

        state
            .unsynced
            .extend(touched.iter().chain(parents.iter()).copied());
        self.sync_donations(state).await?;

        info!(
            "[LedgerReconciler] transfer {:?} -> {} amount={} tx={:?}: donation {} ({}, status={}, return={})",
            transfer.from,
            transfer.to,
            transfer.amount,
            transfer.tx_hash,
            donation_id,
            if matched { "matched" } else { "created" },
            destination.status,
            is_return
        );
        Ok(TransferOutcome::Applied {
            donation: donation_id,
            matched,
            is_return,
        })
    }

    /// Writes the donations changed in memory since the last successful
    /// write. On a store failure the remaining ids stay queued and the next
    /// call retries them before anything else changes.
    async fn sync_donations(&self, state: &mut ReconcilerState) -> LedgerResult<()> {
        let pending: Vec<DonationId> = state.unsynced.iter().copied().collect();
        for (position, id) in pending.iter().enumerate() {
            if let Some(donation) = state.donations.get(id) {
                if let Err(err) = self.store.put_donation(donation.clone()).await {
                    error!(
                        "[LedgerReconciler] failed to store donation {}: {}; unwritten: {:?}",
                        id,
                        err,
                        &pending[position..]
                    );
                    return Err(err);
                }
            }
            state.unsynced.remove(id);
        }
        Ok(())
    }

    async fn resolve_destination(&self, transfer: &Transfer) -> LedgerResult<Destination> {
        let pledge = self.source.pledge(transfer.to).await?;
        let owner = self.admin(pledge.owner).await?;
        let status = derive_status(&pledge, owner.admin_type)?;
        let token = self.tokens.resolve(&pledge.token)?;
        let (owner_type, owner_type_id) = self.owner_of(&owner).await?;
        let timestamp = self
            .source
            .block_timestamp(transfer.block_number)
            .await
            .unwrap_or(None);
        let usd_value = usd_value(self.rates.as_ref(), token, transfer.amount, timestamp);
        Ok(Destination {
            pledge,
            owner,
            owner_type,
            owner_type_id,
            status,
            usd_value,
        })
    }

    /// A transfer is a return when it sends value back to the source
    /// pledge's predecessor within a transaction that already moved value,
    /// and either that earlier transfer funded the source or the source is
    /// owned by an over-fundable entity; or when it moves a pledge proposed
    /// to a project anywhere but to that project. The second flag asks for
    /// the consumed donations to be marked rejected.
    async fn detect_return(
        &self,
        state: &ReconcilerState,
        transfer: &Transfer,
        from_pledge: Option<&Pledge>,
        destination: &Destination,
    ) -> LedgerResult<(bool, bool)> {
        let Some(from_pledge) = from_pledge else {
            return Ok((false, false));
        };

        let siblings = state
            .tx_transfers
            .get(&transfer.tx_hash)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if from_pledge.old_pledge == Some(transfer.to) && !siblings.is_empty() {
            let funded_in_same_tx = siblings.iter().any(|r| r.to == from_pledge.id);
            let over_fundable = match self.store.get_admin_link(from_pledge.owner).await? {
                Some(link) => link.kind.is_over_fundable(),
                None => false,
            };
            if funded_in_same_tx || over_fundable {
                return Ok((true, false));
            }
        }

        if let Some(intended) = from_pledge.intended_project {
            if destination.pledge.owner != intended {
                return Ok((true, true));
            }
        }
        Ok((false, false))
    }

    fn reclassify_failed(&self, state: &mut ReconcilerState, transfer: &Transfer) {
        let ReconcilerState {
            unmatched,
            donations,
            ..
        } = state;
        let Some(failed) = unmatched.get_mut(&None) else {
            return;
        };
        let position = failed.iter().position(|id| {
            let Some(candidate) = donations.get(id) else {
                return false;
            };
            let parent_pledge = candidate
                .parent_donations
                .first()
                .and_then(|p| donations.get(p))
                .and_then(|p| p.pledge_id);
            candidate.tx_hash == transfer.tx_hash
                && candidate.amount == transfer.amount
                && parent_pledge == transfer.from
        });
        let Some(position) = position else {
            return;
        };
        let Some(id) = failed.remove(position) else {
            return;
        };
        if let Some(donation) = donations.get_mut(&id) {
            info!(
                "[LedgerReconciler] failed donation {} reclassified by tx {:?}",
                id, transfer.tx_hash
            );
            donation.pledge_id = Some(transfer.to);
            donation.status = DonationStatus::Pending;
            donation.amount_remaining = U256::zero();
        }
        unmatched
            .entry(Some(transfer.to))
            .or_default()
            .push_front(id);
    }

    fn take_pending_match(
        &self,
        state: &mut ReconcilerState,
        transfer: &Transfer,
    ) -> Option<DonationId> {
        let ReconcilerState {
            unmatched,
            donations,
            ..
        } = state;
        let pending = unmatched.get_mut(&Some(transfer.to))?;
        let position = pending.iter().position(|id| {
            donations
                .get(id)
                .map(|d| {
                    d.tx_hash == transfer.tx_hash
                        && d.amount_remaining.is_zero()
                        && d.amount == transfer.amount
                })
                .unwrap_or(false)
        })?;
        pending.remove(position)
    }

    async fn admin(&self, id: AdminId) -> LedgerResult<PledgeAdmin> {
        if let Some(admin) = self.store.get_admin(id).await? {
            return Ok(admin);
        }
        let admin = self.source.pledge_admin(id).await?;
        self.store.put_admin(admin.clone()).await?;
        Ok(admin)
    }

    async fn owner_of(&self, admin: &PledgeAdmin) -> LedgerResult<(EntityKind, Option<String>)> {
        if let Some(link) = self.store.get_admin_link(admin.id).await? {
            return Ok((link.kind, Some(link.type_id)));
        }
        Ok(match admin.admin_type {
            AdminType::Giver => (EntityKind::Giver, Some(format!("{:?}", admin.address))),
            AdminType::Delegate => (EntityKind::Community, None),
            AdminType::Project => (EntityKind::Campaign, None),
        })
    }

    fn fault(
        &self,
        state: &mut ReconcilerState,
        err: LedgerError,
        transfer: &Transfer,
    ) -> LedgerResult<TransferOutcome> {
        let pledges: Vec<PledgeId> = transfer.from.into_iter().chain([transfer.to]).collect();
        self.record_fault(state, &err, Some(transfer.tx_hash), &pledges);
        match self.policy {
            FaultPolicy::Strict => Err(err),
            FaultPolicy::Advisory => Ok(TransferOutcome::Skipped),
            FaultPolicy::Isolate => {
                state.quarantined.extend(pledges.iter().copied());
                Ok(TransferOutcome::Skipped)
            }
        }
    }

    fn record_fault(
        &self,
        state: &mut ReconcilerState,
        err: &LedgerError,
        tx_hash: Option<H256>,
        pledges: &[PledgeId],
    ) {
        self.metrics
            .ledger_faults
            .with_label_values(&[err.error_type()])
            .inc();
        error!(
            "[LedgerReconciler] ledger fault ({:?} policy): {} tx={:?} pledges={:?}",
            self.policy, err, tx_hash, pledges
        );
        state.faults.push(LedgerFault {
            error_type: err.error_type(),
            message: err.to_string(),
            tx_hash,
            pledges: pledges.to_vec(),
        });
    }

    /// Cancels a project and every project below it. Donations charged to
    /// those projects that still hold value and are not being paid out
    /// become `Canceled`.
    pub async fn cancel_project(&self, project: AdminId) -> LedgerResult<Vec<DonationId>> {
        let mut state = self.state.lock().await;
        self.sync_donations(&mut state).await?;
        let mut canceled_donations = vec![];
        let mut visited = HashSet::new();
        let mut stack = vec![project];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let mut admin = match self.admin(id).await {
                Ok(admin) => admin,
                Err(err) if err.is_ledger_fault() => {
                    self.record_fault(&mut state, &err, None, &[]);
                    if self.policy == FaultPolicy::Strict {
                        return Err(err);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            admin.canceled = true;
            self.store.put_admin(admin).await?;

            if let Some(link) = self.store.get_admin_link(id).await? {
                if link.kind != EntityKind::Giver {
                    if let Some(mut entity) = self.store.get_entity(&link.type_id).await? {
                        entity.status = EntityStatus::Canceled;
                        self.store.put_entity(entity).await?;
                    }
                }
            }

            let owned: Vec<DonationId> = state
                .charged
                .all_ids()
                .filter(|donation_id| {
                    state
                        .donations
                        .get(donation_id)
                        .map(|d| {
                            d.owner_id == id
                                && !d.amount_remaining.is_zero()
                                && !d.status.is_payout()
                                && d.status != DonationStatus::Canceled
                        })
                        .unwrap_or(false)
                })
                .collect();
            for donation_id in owned {
                if let Some(donation) = state.donations.get_mut(&donation_id) {
                    donation.status = DonationStatus::Canceled;
                    state.unsynced.insert(donation_id);
                    canceled_donations.push(donation_id);
                }
            }
            self.sync_donations(&mut state).await?;

            for child in self.store.find_admins_by_parent(id).await? {
                stack.push(child.id);
            }
            info!("[LedgerReconciler] project {} canceled", id);
        }
        Ok(canceled_donations)
    }

    /// Attaches a payment id to the paying donations at `pledge`. Returns
    /// how many donations were updated.
    pub async fn attach_payment(&self, pledge: PledgeId, payment_id: U256) -> LedgerResult<usize> {
        let mut state = self.state.lock().await;
        self.sync_donations(&mut state).await?;
        let mut updated = 0;
        let ReconcilerState {
            donations,
            unsynced,
            ..
        } = &mut *state;
        for donation in donations.values_mut() {
            if donation.pledge_id == Some(pledge) && donation.status == DonationStatus::Paying {
                donation.payment_id = Some(payment_id);
                unsynced.insert(donation.id);
                updated += 1;
            }
        }
        self.sync_donations(&mut state).await?;
        if updated == 0 {
            warn!(
                "[LedgerReconciler] payment {} has no paying donation at pledge {}",
                payment_id, pledge
            );
        }
        Ok(updated)
    }

    pub async fn charged_balance(&self, pledge: PledgeId) -> U256 {
        let state = self.state.lock().await;
        state.charged.balance(pledge, &state.donations)
    }

    pub async fn charged_ids(&self, pledge: PledgeId) -> Vec<DonationId> {
        self.state.lock().await.charged.ids(pledge).collect()
    }

    /// Pledges whose charged balance differs from their chain amount.
    pub async fn check_conservation(&self, pledges: &[Pledge]) -> Vec<ConservationViolation> {
        let state = self.state.lock().await;
        pledges
            .iter()
            .filter_map(|pledge| {
                let charged = state.charged.balance(pledge.id, &state.donations);
                (charged != pledge.amount).then_some(ConservationViolation {
                    pledge: pledge.id,
                    expected: pledge.amount,
                    charged,
                })
            })
            .collect()
    }

    pub async fn donation(&self, id: DonationId) -> Option<Donation> {
        self.state.lock().await.donations.get(&id).cloned()
    }

    /// Donations matched or created by transfers since construction.
    pub async fn used_donations(&self) -> HashSet<DonationId> {
        self.state.lock().await.used.clone()
    }

    pub async fn faults(&self) -> Vec<LedgerFault> {
        self.state.lock().await.faults.clone()
    }

    pub async fn is_quarantined(&self, pledge: PledgeId) -> bool {
        self.state.lock().await.quarantined.contains(&pledge)
    }

    pub async fn giver_of(&self, id: DonationId) -> Option<Address> {
        self.state
            .lock()
            .await
            .donations
            .get(&id)
            .and_then(|d| d.giver_address)
    }
}
