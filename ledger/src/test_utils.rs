// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::{ChainClient, PledgeSource};
use crate::confirmation::ConfirmedEventHandler;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{event_identity, EventKind};
use crate::rates::{TokenConfig, TokenRegistry};
use crate::types::{
    AdminId, AdminType, Donation, DonationId, DonationStatus, EntityKind, EventRecord,
    EventStatus, Pledge, PledgeAdmin, PledgeId, RawLog,
};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

pub const LP_ADDRESS: Address = Address::repeat_byte(0x1b);
pub const TEST_TOKEN: Address = Address::repeat_byte(0xee);

pub fn u64_topic(value: u64) -> H256 {
    H256::from_low_u64_be(value)
}

pub fn raw_log(
    kind: EventKind,
    extra_topics: Vec<H256>,
    data: Vec<u8>,
    tx_hash: H256,
    block_number: u64,
    log_index: u64,
) -> RawLog {
    let mut topics = vec![kind.topic()];
    topics.extend(extra_topics);
    RawLog {
        address: LP_ADDRESS,
        topics,
        data: Bytes::from(data),
        block_number,
        block_hash: H256::from_low_u64_be(block_number),
        transaction_hash: tx_hash,
        transaction_index: 0,
        log_index,
        transaction_log_index: None,
        removed: false,
    }
}

pub fn transfer_log(
    from: u64,
    to: u64,
    amount: u64,
    tx_hash: H256,
    block_number: u64,
    log_index: u64,
) -> RawLog {
    raw_log(
        EventKind::Transfer,
        vec![u64_topic(from), u64_topic(to)],
        ethers::abi::encode(&[Token::Uint(U256::from(amount))]),
        tx_hash,
        block_number,
        log_index,
    )
}

pub fn test_tokens() -> TokenRegistry {
    TokenRegistry::new([TokenConfig {
        symbol: "ETH".to_string(),
        address: TEST_TOKEN,
        decimals: 18,
    }])
}

pub fn pid(raw: u64) -> PledgeId {
    PledgeId::new(raw).unwrap()
}

/// A plain `Pledged` pledge in the test token.
pub fn pledge(id: u64, owner: AdminId, amount: u64) -> Pledge {
    Pledge {
        id: pid(id),
        owner,
        token: TEST_TOKEN,
        amount: U256::from(amount),
        pledge_state: 0,
        intended_project: None,
        delegates: vec![],
        old_pledge: None,
        commit_time: 0,
    }
}

pub fn admin(id: AdminId, admin_type: AdminType) -> PledgeAdmin {
    PledgeAdmin {
        id,
        admin_type,
        address: Address::from_low_u64_be(0x1000 + id),
        name: format!("admin-{}", id),
        url: String::new(),
        parent_project: None,
        canceled: false,
        plugin: None,
        commit_time: 0,
    }
}

pub fn donation(
    id: u64,
    pledge: Option<u64>,
    amount: u64,
    remaining: u64,
    status: DonationStatus,
) -> Donation {
    Donation {
        id: DonationId(id),
        pledge_id: pledge.and_then(PledgeId::new),
        amount: U256::from(amount),
        amount_remaining: U256::from(remaining),
        status,
        owner_id: 1,
        owner_type: EntityKind::Giver,
        owner_type_id: None,
        intended_project_id: None,
        delegate_id: None,
        giver_address: None,
        token_address: TEST_TOKEN,
        tx_hash: H256::zero(),
        parent_donations: vec![],
        is_return: false,
        mined: false,
        usd_value: None,
        payment_id: None,
    }
}

pub fn event_record(tx_hash: H256, block_number: u64, log_index: u64) -> EventRecord {
    let log = transfer_log(0, 1, 10, tx_hash, block_number, log_index);
    EventRecord {
        identity: event_identity(&log),
        address: log.address,
        transaction_hash: tx_hash,
        transaction_index: log.transaction_index,
        block_number,
        block_hash: log.block_hash,
        log_index,
        transaction_log_index: log.transaction_log_index,
        topics: log.topics,
        data: log.data,
        event: "Transfer".to_string(),
        return_values: serde_json::Value::Null,
        confirmations: 0,
        confirmed: false,
        status: EventStatus::Pending,
        processing_error: None,
    }
}

/// Records dispatched events, optionally failing on one transaction.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(u64, u64, H256)>>,
    fail: Option<(H256, LedgerError)>,
}

impl RecordingHandler {
    pub fn failing_on(tx_hash: H256, error: LedgerError) -> Self {
        Self {
            seen: Mutex::new(vec![]),
            fail: Some((tx_hash, error)),
        }
    }

    pub async fn seen(&self) -> Vec<(u64, u64, H256)> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl ConfirmedEventHandler for RecordingHandler {
    async fn handle(&self, event: &EventRecord) -> LedgerResult<()> {
        self.seen.lock().await.push((
            event.block_number,
            event.log_index,
            event.transaction_hash,
        ));
        match &self.fail {
            Some((tx, error)) if *tx == event.transaction_hash => Err(error.clone()),
            _ => Ok(()),
        }
    }
}

/// In-memory chain: pledges, admins, logs and a settable head.
#[derive(Default)]
pub struct MockChainClient {
    latest_block: StdMutex<u64>,
    logs: StdMutex<Vec<RawLog>>,
    pledges: StdMutex<HashMap<PledgeId, Pledge>>,
    admins: StdMutex<HashMap<AdminId, PledgeAdmin>>,
    fail_pledge_reads: StdMutex<u32>,
}

impl MockChainClient {
    pub fn set_latest_block(&self, block: u64) {
        *self.latest_block.lock().unwrap() = block;
    }

    pub fn add_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    /// Drops every log of `tx_hash`, as a reorg onto a fork without it would.
    pub fn drop_logs_of(&self, tx_hash: H256) {
        self.logs
            .lock()
            .unwrap()
            .retain(|log| log.transaction_hash != tx_hash);
    }

    pub fn add_pledge(&self, pledge: Pledge) {
        self.pledges.lock().unwrap().insert(pledge.id, pledge);
    }

    pub fn add_admin(&self, admin: PledgeAdmin) {
        self.admins.lock().unwrap().insert(admin.id, admin);
    }

    /// The next `count` pledge reads fail with a connectivity error.
    pub fn fail_next_pledge_reads(&self, count: u32) {
        *self.fail_pledge_reads.lock().unwrap() = count;
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PledgeSource for MockChainClient {
    async fn pledge(&self, id: PledgeId) -> LedgerResult<Pledge> {
        {
            let mut failures = self.fail_pledge_reads.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Rpc("connection reset".into()));
            }
        }
        self.pledges
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::MissingPledge(id))
    }

    async fn pledge_admin(&self, id: AdminId) -> LedgerResult<PledgeAdmin> {
        self.admins
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::MissingPledgeAdmin(id))
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn latest_block(&self) -> LedgerResult<u64> {
        Ok(*self.latest_block.lock().unwrap())
    }

    async fn past_logs(&self, from_block: u64, to_block: u64) -> LedgerResult<Vec<RawLog>> {
        let mut logs: Vec<RawLog> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
            .cloned()
            .collect();
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    async fn number_of_pledges(&self) -> LedgerResult<u64> {
        Ok(self.pledges.lock().unwrap().len() as u64)
    }

    async fn number_of_pledge_admins(&self) -> LedgerResult<u64> {
        Ok(self.admins.lock().unwrap().len() as u64)
    }
}
