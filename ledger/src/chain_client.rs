// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thin client over the chain RPC endpoint.
//!
//! ```text
//!   ┌──────────────────┐  past_logs / latest_block   ┌────────────────┐
//!   │  EthChainClient  │◄────────────────────────────│  LedgerWatcher │
//!   │  (ethers)        │                             └───────┬────────┘
//!   └────────┬─────────┘                                     │
//!            │ polled by spawn_log_poller                    │ mpsc
//!            ▼                                               ▼
//!     ChainNotification::{Log, NewBlock} ─────────► ConfirmationTracker
//! ```
//!
//! Pledge and admin reads go through [`PledgeSource`], which is also
//! implemented by the simulator's cached snapshot.

use crate::error::{LedgerError, LedgerResult};
use crate::events::event_identity;
use crate::metrics::LedgerMetrics;
use crate::types::{AdminId, AdminType, Pledge, PledgeAdmin, PledgeId, RawLog};
use async_trait::async_trait;
use ethers::abi::{Detokenize, Tokenize};
use ethers::contract::BaseContract;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Filter, Log, TransactionRequest, H256, U256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LIQUID_PLEDGING_ABI: &[&str] = &[
    "function numberOfPledges() external view returns (uint256)",
    "function numberOfPledgeAdmins() external view returns (uint256)",
    "function getPledge(uint64 idPledge) external view returns (uint256 amount, uint64 owner, uint64 nDelegates, uint64 intendedProject, uint64 commitTime, uint64 oldPledge, address token, uint8 pledgeState)",
    "function getPledgeDelegate(uint64 idPledge, uint64 idxDelegate) external view returns (uint64 idDelegate, address addr, string name)",
    "function getPledgeAdmin(uint64 idAdmin) external view returns (uint8 adminType, address addr, string name, string url, uint64 commitTime, uint64 parentProject, bool canceled, address plugin)",
];

const CHANNEL_CAPACITY: usize = 1024;

/// Read access to pledge and admin state.
#[async_trait]
pub trait PledgeSource: Send + Sync {
    async fn pledge(&self, id: PledgeId) -> LedgerResult<Pledge>;

    async fn pledge_admin(&self, id: AdminId) -> LedgerResult<PledgeAdmin>;

    /// Timestamp of a block, when the source knows it.
    async fn block_timestamp(&self, _block_number: u64) -> LedgerResult<Option<u64>> {
        Ok(None)
    }
}

#[async_trait]
pub trait ChainClient: PledgeSource {
    async fn latest_block(&self) -> LedgerResult<u64>;

    /// Logs of all watched contracts in `[from_block, to_block]`. The caller
    /// is responsible for chunking the range.
    async fn past_logs(&self, from_block: u64, to_block: u64) -> LedgerResult<Vec<RawLog>>;

    async fn number_of_pledges(&self) -> LedgerResult<u64>;

    async fn number_of_pledge_admins(&self) -> LedgerResult<u64>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChainNotification {
    NewBlock(u64),
    Log(RawLog),
}

pub struct EthChainClient<P> {
    provider: Provider<P>,
    liquid_pledging: Address,
    watched_addresses: Vec<Address>,
    contract: BaseContract,
    metrics: Arc<LedgerMetrics>,
}

impl EthChainClient<Http> {
    pub fn new_http(
        rpc_url: &str,
        liquid_pledging: Address,
        extra_addresses: Vec<Address>,
        metrics: Arc<LedgerMetrics>,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        info!(
            "[EthChainClient] connecting to {} for liquid pledging {:?}",
            rpc_url, liquid_pledging
        );
        Ok(Self::new(provider, liquid_pledging, extra_addresses, metrics)?)
    }
}

impl<P: JsonRpcClient + 'static> EthChainClient<P> {
    pub fn new(
        provider: Provider<P>,
        liquid_pledging: Address,
        extra_addresses: Vec<Address>,
        metrics: Arc<LedgerMetrics>,
    ) -> LedgerResult<Self> {
        let abi = ethers::abi::parse_abi(LIQUID_PLEDGING_ABI)
            .map_err(|e| LedgerError::Config(format!("invalid contract abi: {}", e)))?;
        let mut watched_addresses = vec![liquid_pledging];
        for address in extra_addresses {
            if !watched_addresses.contains(&address) {
                watched_addresses.push(address);
            }
        }
        Ok(Self {
            provider,
            liquid_pledging,
            watched_addresses,
            contract: BaseContract::from(abi),
            metrics,
        })
    }

    pub fn watched_addresses(&self) -> &[Address] {
        &self.watched_addresses
    }

    async fn call<T: Tokenize + Send, D: Detokenize + Send>(
        &self,
        method: &'static str,
        args: T,
    ) -> LedgerResult<D> {
        self.metrics
            .rpc_queries
            .with_label_values(&[method])
            .inc();
        let _timer = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let data = self.contract.encode(method, args).map_err(|e| {
            LedgerError::Decode(format!("encoding {} arguments: {}", method, e))
        })?;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.liquid_pledging)
            .data(data)
            .into();
        let output = self
            .provider
            .call(&tx, None)
            .await
            .map_err(LedgerError::from)
            .tap_err(|e| warn!("[EthChainClient] {} failed: {:?}", method, e))?;
        self.contract
            .decode_output(method, output)
            .map_err(|e| LedgerError::Decode(format!("decoding {} output: {}", method, e)))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> PledgeSource for EthChainClient<P> {
    async fn pledge(&self, id: PledgeId) -> LedgerResult<Pledge> {
        let (amount, owner, n_delegates, intended_project, commit_time, old_pledge, token, state): (
            U256,
            u64,
            u64,
            u64,
            u64,
            u64,
            Address,
            u8,
        ) = self.call("getPledge", id.get()).await?;

        let mut delegates = Vec::with_capacity(n_delegates as usize);
        for index in 1..=n_delegates {
            let (delegate, _address, _name): (u64, Address, String) = self
                .call("getPledgeDelegate", (id.get(), index))
                .await?;
            delegates.push(delegate);
        }

        Ok(Pledge {
            id,
            owner,
            token,
            amount,
            pledge_state: state,
            intended_project: (intended_project != 0).then_some(intended_project),
            delegates,
            old_pledge: PledgeId::new(old_pledge),
            commit_time,
        })
    }

    async fn pledge_admin(&self, id: AdminId) -> LedgerResult<PledgeAdmin> {
        let (admin_type, address, name, url, commit_time, parent_project, canceled, plugin): (
            u8,
            Address,
            String,
            String,
            u64,
            u64,
            bool,
            Address,
        ) = self.call("getPledgeAdmin", id).await?;
        let admin_type = AdminType::try_from(admin_type)
            .map_err(|_| LedgerError::Decode(format!("admin {} has type {}", id, admin_type)))?;
        Ok(PledgeAdmin {
            id,
            admin_type,
            address,
            name,
            url,
            parent_project: (parent_project != 0).then_some(parent_project),
            canceled,
            plugin: (!plugin.is_zero()).then_some(plugin),
            commit_time,
        })
    }

    async fn block_timestamp(&self, block_number: u64) -> LedgerResult<Option<u64>> {
        let block = self.provider.get_block(block_number).await?;
        Ok(block.map(|b| b.timestamp.as_u64()))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainClient for EthChainClient<P> {
    async fn latest_block(&self) -> LedgerResult<u64> {
        self.metrics
            .rpc_queries
            .with_label_values(&["eth_blockNumber"])
            .inc();
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn past_logs(&self, from_block: u64, to_block: u64) -> LedgerResult<Vec<RawLog>> {
        self.metrics
            .rpc_queries
            .with_label_values(&["eth_getLogs"])
            .inc();
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(self.watched_addresses.clone());
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(LedgerError::from)
            .tap_err(|e| {
                tracing::error!(
                    "[EthChainClient] get_logs failed. Filter: {:?}. Error {:?}",
                    filter,
                    e
                )
            })?;
        logs.into_iter()
            .map(|log| {
                if !self.watched_addresses.contains(&log.address) {
                    return Err(LedgerError::Provider(format!(
                        "Provider returns logs from different contract address (expected: {:?}): {:?}",
                        self.watched_addresses, log.address
                    )));
                }
                raw_log_from_ethers(log)
            })
            .collect()
    }

    async fn number_of_pledges(&self) -> LedgerResult<u64> {
        let count: U256 = self.call("numberOfPledges", ()).await?;
        Ok(count.as_u64())
    }

    async fn number_of_pledge_admins(&self) -> LedgerResult<u64> {
        let count: U256 = self.call("numberOfPledgeAdmins", ()).await?;
        Ok(count.as_u64())
    }
}

// Logs returned by a node always carry their position; pending logs do not
// and are rejected here.
fn raw_log_from_ethers(log: Log) -> LedgerResult<RawLog> {
    let missing = |field: &str| LedgerError::Provider(format!("Provider returns log without {}", field));
    Ok(RawLog {
        address: log.address,
        topics: log.topics,
        data: log.data,
        block_number: log.block_number.ok_or_else(|| missing("block_number"))?.as_u64(),
        block_hash: log.block_hash.ok_or_else(|| missing("block_hash"))?,
        transaction_hash: log
            .transaction_hash
            .ok_or_else(|| missing("transaction_hash"))?,
        transaction_index: log
            .transaction_index
            .ok_or_else(|| missing("transaction_index"))?
            .as_u64(),
        log_index: log.log_index.ok_or_else(|| missing("log_index"))?.as_u64(),
        transaction_log_index: log.transaction_log_index.map(|i| i.as_u64()),
        removed: log.removed.unwrap_or(false),
    })
}

/// Logs delivered from blocks that can still be reorganized, keyed by
/// identity. Re-reads of those blocks are compared against it so that moved
/// logs are delivered again and vanished ones are reported as removed.
#[derive(Debug, Default)]
pub struct RecentLogs {
    logs: HashMap<H256, RawLog>,
}

impl RecentLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn remember(&mut self, log: &RawLog) {
        let identity = event_identity(log);
        if log.removed {
            self.logs.remove(&identity);
        } else {
            self.logs.insert(identity, log.clone());
        }
    }

    /// Takes a fresh read of `[from_block, to_block]` and returns what has
    /// to be forwarded: known logs of the range missing from the read,
    /// flagged `removed`, followed by the logs that are new or changed
    /// position. Unchanged logs are not returned.
    pub fn reconcile(&mut self, from_block: u64, to_block: u64, fresh: Vec<RawLog>) -> Vec<RawLog> {
        let fresh: Vec<(H256, RawLog)> = fresh
            .into_iter()
            .filter(|log| !log.removed)
            .map(|log| (event_identity(&log), log))
            .collect();
        let present: HashSet<H256> = fresh.iter().map(|(identity, _)| *identity).collect();

        let gone: Vec<H256> = self
            .logs
            .iter()
            .filter(|(identity, log)| {
                (from_block..=to_block).contains(&log.block_number) && !present.contains(*identity)
            })
            .map(|(identity, _)| *identity)
            .collect();
        let mut removed: Vec<RawLog> = gone
            .into_iter()
            .filter_map(|identity| self.logs.remove(&identity))
            .map(|mut log| {
                log.removed = true;
                log
            })
            .collect();
        removed.sort_by_key(|log| (log.block_number, log.log_index));
        for log in &removed {
            warn!(
                "[LogPoller] log tx={:?} log_index={} at block {} is gone from the chain",
                log.transaction_hash, log.log_index, log.block_number
            );
        }

        let mut forward = removed;
        for (identity, log) in fresh {
            let unchanged = self.logs.get(&identity).is_some_and(|known| {
                known.block_number == log.block_number
                    && known.block_hash == log.block_hash
                    && known.log_index == log.log_index
                    && known.transaction_index == log.transaction_index
            });
            if !unchanged {
                self.logs.insert(identity, log.clone());
                forward.push(log);
            }
        }
        forward
    }

    /// Drops logs below `block`, which re-reads no longer cover.
    pub fn forget_below(&mut self, block: u64) {
        self.logs.retain(|_, log| log.block_number >= block);
    }
}

/// Where a log poller starts reading and how far back it re-reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStart {
    /// First block not read yet.
    pub next_block: u64,
    /// Blocks below the last head that are read again whenever the head
    /// advances.
    pub rescan_depth: u64,
    /// Nothing below this block is ever read.
    pub min_block: u64,
}

/// Polls the chain head and forwards log changes followed by the new head.
/// Each pass re-reads the last `rescan_depth` blocks, so logs dropped or
/// moved by a reorg inside that window are forwarded again. Connectivity
/// failures are logged and retried on the next tick.
pub fn spawn_log_poller<C: ChainClient + 'static>(
    client: Arc<C>,
    start: PollStart,
    mut recent: RecentLogs,
    poll_interval: Duration,
    max_block_range: u64,
    cancel: CancellationToken,
) -> (mpsc::Receiver<ChainNotification>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut next_block = start.next_block;
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[LogPoller] cancelled at block {}", next_block);
                    break;
                }
                _ = interval.tick() => {}
            }
            let latest = match client.latest_block().await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!("[LogPoller] latest_block failed: {:?}", e);
                    continue;
                }
            };
            if latest < next_block {
                continue;
            }
            let scan_from = next_block
                .saturating_sub(start.rescan_depth)
                .max(start.min_block);
            recent.forget_below(scan_from);
            let mut from = scan_from;
            while from <= latest {
                let end = latest.min(from + max_block_range.saturating_sub(1));
                match client.past_logs(from, end).await {
                    Ok(logs) => {
                        debug!("[LogPoller] {} logs in [{}, {}]", logs.len(), from, end);
                        for log in recent.reconcile(from, end, logs) {
                            if tx.send(ChainNotification::Log(log)).await.is_err() {
                                return;
                            }
                        }
                        from = end + 1;
                    }
                    Err(e) => {
                        warn!("[LogPoller] past_logs [{}, {}] failed: {:?}", from, end, e);
                        break;
                    }
                }
            }
            if from > next_block {
                let head = from - 1;
                next_block = from;
                if tx.send(ChainNotification::NewBlock(head)).await.is_err() {
                    return;
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{transfer_log, MockChainClient};
    use ethers::abi::Token;
    use ethers::providers::MockProvider;
    use ethers::types::{Bytes, H256};

    #[tokio::test]
    async fn test_get_pledge_admin_decodes_contract_output() {
        let (provider, mock) = Provider::mocked();
        let output = ethers::abi::encode(&[
            Token::Uint(U256::from(2u8)),
            Token::Address(Address::repeat_byte(0x11)),
            Token::String("milestone".into()),
            Token::String("ipfs://x".into()),
            Token::Uint(U256::zero()),
            Token::Uint(U256::from(4)),
            Token::Bool(false),
            Token::Address(Address::repeat_byte(0x22)),
        ]);
        mock.push::<Bytes, _>(Bytes::from(output)).unwrap();
        let client: EthChainClient<MockProvider> = EthChainClient::new(
            provider,
            Address::repeat_byte(1),
            vec![],
            Arc::new(LedgerMetrics::new_for_testing()),
        )
        .unwrap();

        let admin = client.pledge_admin(9).await.unwrap();
        assert_eq!(admin.admin_type, AdminType::Project);
        assert_eq!(admin.parent_project, Some(4));
        assert_eq!(admin.plugin, Some(Address::repeat_byte(0x22)));
        assert_eq!(admin.name, "milestone");
    }

    #[tokio::test]
    async fn test_watched_addresses_are_deduplicated() {
        let (provider, _mock) = Provider::mocked();
        let lp = Address::repeat_byte(1);
        let client = EthChainClient::new(
            provider,
            lp,
            vec![lp, Address::repeat_byte(2)],
            Arc::new(LedgerMetrics::new_for_testing()),
        )
        .unwrap();
        assert_eq!(client.watched_addresses(), &[lp, Address::repeat_byte(2)]);
    }

    #[tokio::test]
    async fn test_poller_forwards_logs_then_head() {
        let client = Arc::new(MockChainClient::default());
        client.set_latest_block(12);
        client.add_log(transfer_log(0, 1, 5, H256::repeat_byte(1), 11, 0));
        client.add_log(transfer_log(1, 2, 5, H256::repeat_byte(2), 12, 0));

        let cancel = CancellationToken::new();
        let (mut rx, handle) = spawn_log_poller(
            client.clone(),
            PollStart {
                next_block: 10,
                rescan_depth: 0,
                min_block: 0,
            },
            RecentLogs::new(),
            Duration::from_millis(10),
            100,
            cancel.clone(),
        );

        let mut received = vec![];
        while let Some(notification) = rx.recv().await {
            let is_head = matches!(notification, ChainNotification::NewBlock(_));
            received.push(notification);
            if is_head {
                break;
            }
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(received.len(), 3);
        assert!(matches!(&received[0], ChainNotification::Log(l) if l.block_number == 11));
        assert!(matches!(&received[1], ChainNotification::Log(l) if l.block_number == 12));
        assert_eq!(received[2], ChainNotification::NewBlock(12));
    }

    #[test]
    fn test_recent_logs_forward_only_changes() {
        let mut recent = RecentLogs::new();
        let a = transfer_log(0, 1, 5, H256::repeat_byte(1), 100, 0);
        let b = transfer_log(0, 2, 5, H256::repeat_byte(2), 101, 0);
        assert_eq!(
            recent.reconcile(100, 101, vec![a.clone(), b.clone()]),
            vec![a.clone(), b.clone()]
        );
        // a second read of the same blocks has nothing new
        assert!(recent.reconcile(100, 101, vec![a.clone(), b.clone()]).is_empty());

        // a is reorged out and b moves one block up
        let mut b_moved = b.clone();
        b_moved.block_number = 102;
        b_moved.block_hash = H256::repeat_byte(0xf2);
        let forwarded = recent.reconcile(100, 102, vec![b_moved.clone()]);
        let mut a_removed = a;
        a_removed.removed = true;
        assert_eq!(forwarded, vec![a_removed, b_moved]);
        assert_eq!(recent.len(), 1);

        recent.forget_below(103);
        assert!(recent.is_empty());
    }

    #[test]
    fn test_recent_logs_only_judge_the_read_range() {
        let mut recent = RecentLogs::new();
        let early = transfer_log(0, 1, 5, H256::repeat_byte(1), 90, 0);
        recent.remember(&early);
        assert!(recent.reconcile(95, 100, vec![]).is_empty());
        assert_eq!(recent.len(), 1);
    }
}
