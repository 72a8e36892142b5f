// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ledger data model: chain-side pledges and admins, and the off-chain
//! donation mirror derived from them.

use crate::error::{LedgerError, LedgerResult};
use ethers::types::{Address, Bytes, H256, U256};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// On-chain pledge admin id. Admin ids start at 1; optional references use
/// `Option<AdminId>` instead of the chain's `0` sentinel.
pub type AdminId = u64;

/// A non-zero on-chain pledge id. The chain uses `0` for "no pledge"; that
/// case is expressed as `Option<PledgeId>` everywhere in this crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct PledgeId(u64);

impl PledgeId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for PledgeId {
    type Error = String;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        PledgeId::new(raw).ok_or_else(|| "pledge id 0 is reserved".to_string())
    }
}

impl From<PledgeId> for u64 {
    fn from(id: PledgeId) -> u64 {
        id.0
    }
}

impl fmt::Display for PledgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, strum_macros::Display,
)]
#[repr(u8)]
pub enum PledgeState {
    Pledged = 0,
    Paying = 1,
    Paid = 2,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    TryFromPrimitive,
    IntoPrimitive,
    strum_macros::Display,
)]
#[repr(u8)]
pub enum AdminType {
    Giver = 0,
    Delegate = 1,
    Project = 2,
}

/// Chain snapshot of a pledge. `pledge_state` keeps the raw on-chain value so
/// an unexpected state surfaces as an error when it is interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pledge {
    pub id: PledgeId,
    pub owner: AdminId,
    pub token: Address,
    pub amount: U256,
    pub pledge_state: u8,
    pub intended_project: Option<AdminId>,
    #[serde(default)]
    pub delegates: Vec<AdminId>,
    pub old_pledge: Option<PledgeId>,
    #[serde(default)]
    pub commit_time: u64,
}

impl Pledge {
    pub fn state(&self) -> LedgerResult<PledgeState> {
        PledgeState::try_from(self.pledge_state).map_err(|_| {
            LedgerError::UnrecognizedPledgeState {
                pledge: self.id,
                state: self.pledge_state,
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PledgeAdmin {
    pub id: AdminId,
    pub admin_type: AdminType,
    pub address: Address,
    pub name: String,
    #[serde(default)]
    pub url: String,
    pub parent_project: Option<AdminId>,
    #[serde(default)]
    pub canceled: bool,
    pub plugin: Option<Address>,
    #[serde(default)]
    pub commit_time: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DonationId(pub u64);

impl fmt::Display for DonationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "PascalCase")]
pub enum DonationStatus {
    /// Created by the off-chain write path, waiting for its chain event.
    Pending,
    /// Held by a giver or delegate, not yet committed to a project.
    Waiting,
    Committed,
    /// Proposed to an intended project which has not accepted yet.
    ToApprove,
    Rejected,
    Canceled,
    Paying,
    Paid,
    /// The originating transaction never made it on chain.
    Failed,
}

impl DonationStatus {
    pub fn is_payout(&self) -> bool {
        matches!(self, DonationStatus::Paying | DonationStatus::Paid)
    }
}

/// Kind of off-chain entity that owns a pledge admin.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    Giver,
    Community,
    Campaign,
    Milestone,
}

impl EntityKind {
    /// Entities that can receive more than they asked for, whose excess is
    /// sent back in the same transaction.
    pub fn is_over_fundable(&self) -> bool {
        matches!(self, EntityKind::Milestone)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: DonationId,
    /// `None` for donations whose transaction failed before reaching a pledge.
    pub pledge_id: Option<PledgeId>,
    pub amount: U256,
    pub amount_remaining: U256,
    pub status: DonationStatus,
    pub owner_id: AdminId,
    pub owner_type: EntityKind,
    pub owner_type_id: Option<String>,
    pub intended_project_id: Option<AdminId>,
    pub delegate_id: Option<AdminId>,
    pub giver_address: Option<Address>,
    pub token_address: Address,
    pub tx_hash: H256,
    #[serde(default)]
    pub parent_donations: Vec<DonationId>,
    #[serde(default)]
    pub is_return: bool,
    #[serde(default)]
    pub mined: bool,
    pub usd_value: Option<f64>,
    pub payment_id: Option<U256>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventStatus {
    #[default]
    Pending,
    /// Confirmed, waiting to be dispatched.
    Waiting,
    Processing,
    Processed,
    Failed,
}

/// Raw log as delivered by the chain client, before decoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: H256,
    pub transaction_hash: H256,
    pub transaction_index: u64,
    pub log_index: u64,
    #[serde(default)]
    pub transaction_log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

/// Persisted event record tracked through confirmation and dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub identity: H256,
    pub address: Address,
    pub transaction_hash: H256,
    pub transaction_index: u64,
    pub block_number: u64,
    pub block_hash: H256,
    pub log_index: u64,
    #[serde(default)]
    pub transaction_log_index: Option<u64>,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub event: String,
    pub return_values: serde_json::Value,
    pub confirmations: u64,
    pub confirmed: bool,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub processing_error: Option<String>,
}

impl EventRecord {
    /// Sort key for replay and dispatch.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    /// Key enforced unique by the event store.
    pub fn unique_key(&self) -> (u64, u64, u64) {
        (self.transaction_index, self.block_number, self.log_index)
    }

    /// The log this record was observed from, flagged as removed when
    /// `removed` is set. Hashes to the same identity.
    pub fn to_raw_log(&self, removed: bool) -> RawLog {
        RawLog {
            address: self.address,
            topics: self.topics.clone(),
            data: self.data.clone(),
            block_number: self.block_number,
            block_hash: self.block_hash,
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
            transaction_log_index: self.transaction_log_index,
            removed,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntityStatus {
    #[default]
    Proposed,
    Active,
    InProgress,
    NeedsReview,
    Completed,
    Paid,
    Canceled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DonationCounter {
    pub symbol: String,
    pub decimals: u8,
    pub total_donated: U256,
    pub current_balance: U256,
    pub donation_count: u64,
}

/// Off-chain entity (community, campaign, milestone) owning a pledge admin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub admin_id: Option<AdminId>,
    pub status: EntityStatus,
    pub title: String,
    /// Transaction that created the admin, set by the off-chain write path.
    pub tx_hash: Option<H256>,
    pub reviewer: Option<Address>,
    pub recipient: Option<Address>,
    pub max_amount: Option<U256>,
    #[serde(default)]
    pub counters: BTreeMap<String, DonationCounter>,
    #[serde(default)]
    pub people_count: u64,
    #[serde(default)]
    pub fully_funded: bool,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: EntityKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            admin_id: None,
            status: EntityStatus::Proposed,
            title: title.into(),
            tx_hash: None,
            reviewer: None,
            recipient: None,
            max_amount: None,
            counters: BTreeMap::new(),
            people_count: 0,
            fully_funded: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub address: Address,
    pub giver_id: Option<AdminId>,
    pub name: String,
}

/// Links an on-chain admin to the off-chain record representing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminLink {
    pub admin_id: AdminId,
    pub kind: EntityKind,
    /// Entity id, or the giver address for givers.
    pub type_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBinding {
    pub namespace: H256,
    pub app_id: H256,
    pub address: Address,
}
