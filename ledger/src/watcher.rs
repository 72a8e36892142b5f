// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Live pipeline: backfill from the stored watermark, then follow the chain
//! head until stopped.
//!
//! ```text
//!   start():
//!     watermark ──► backfill [max(start_block, watermark + 1 - depth), head] ──► tracker
//!     spawn_log_poller(head + 1) ──► Log ──► tracker.observe()
//!                                └─► NewBlock(n) ──► tracker.on_new_block(n)
//!                                                     └─► watermark = n
//!   stop(): cancel ──► join tasks
//! ```
//!
//! `depth` is the confirmation depth. Blocks that deep below the head are
//! read again on every pass and compared with the logs already delivered,
//! including unconfirmed events stored before a restart, so logs a reorg
//! moved or dropped reach the tracker as merges or removals.
//!
//! A ledger fault raised while dispatching halts the pipeline.

use crate::chain_client::{
    spawn_log_poller, ChainClient, ChainNotification, PollStart, RecentLogs,
};
use crate::config::FetchConfig;
use crate::confirmation::{ConfirmationTracker, ConfirmedEventHandler};
use crate::error::LedgerResult;
use crate::metrics::LedgerMetrics;
use crate::retry_with_max_attempts;
use crate::store::LedgerStore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct LedgerWatcher<C, S, H> {
    client: Arc<C>,
    store: Arc<S>,
    tracker: Arc<ConfirmationTracker<S, H>>,
    fetch: FetchConfig,
    start_block: u64,
    metrics: Arc<LedgerMetrics>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<C, S, H> LedgerWatcher<C, S, H>
where
    C: ChainClient + 'static,
    S: LedgerStore + 'static,
    H: ConfirmedEventHandler + 'static,
{
    pub fn new(
        client: Arc<C>,
        store: Arc<S>,
        tracker: Arc<ConfirmationTracker<S, H>>,
        fetch: FetchConfig,
        start_block: u64,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            client,
            store,
            tracker,
            fetch,
            start_block,
            metrics,
            cancel: CancellationToken::new(),
            handles: Mutex::new(vec![]),
        }
    }

    /// Backfills up to the current head, then spawns the live subscription.
    /// Fails if the backfill cannot be read or raises a ledger fault.
    pub async fn start(&self) -> LedgerResult<()> {
        let depth = self.tracker.required_confirmations();
        let watermark = self.store.last_processed_block().await?;
        let from_block = watermark
            .map(|block| (block + 1).saturating_sub(depth))
            .unwrap_or(0)
            .max(self.start_block);

        let mut recent = RecentLogs::new();
        for event in self.store.undispatched_events().await? {
            if !event.confirmed {
                recent.remember(&event.to_raw_log(false));
            }
        }
        let head = self.backfill(from_block, &mut recent).await?;

        let start = PollStart {
            next_block: head.map(|h| h + 1).unwrap_or(from_block),
            rescan_depth: depth,
            min_block: self.start_block,
        };
        let (rx, poller) = spawn_log_poller(
            self.client.clone(),
            start,
            recent,
            self.fetch.poll_interval,
            self.fetch.max_block_range,
            self.cancel.child_token(),
        );
        let consumer = tokio::spawn(run_consumer(
            rx,
            self.store.clone(),
            self.tracker.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        ));
        self.handles.lock().await.extend([poller, consumer]);
        info!("[LedgerWatcher] following chain head from block {}", from_block);
        Ok(())
    }

    /// Returns the head the backfill ran to, or `None` if there was nothing
    /// to read.
    async fn backfill(&self, from_block: u64, recent: &mut RecentLogs) -> LedgerResult<Option<u64>> {
        let client = self.client.clone();
        let (head, _) = retry_with_max_attempts!(client.latest_block(), &self.fetch);
        let head = head?;
        if head < from_block {
            info!(
                "[LedgerWatcher] nothing to backfill, head {} < {}",
                head, from_block
            );
            return Ok(None);
        }
        info!("[LedgerWatcher] backfilling [{}, {}]", from_block, head);

        let range = self.fetch.max_block_range.max(1);
        let mut start = from_block;
        let mut observed = 0;
        while start <= head {
            let end = head.min(start.saturating_add(range - 1));
            let (logs, _) = retry_with_max_attempts!(client.past_logs(start, end), &self.fetch);
            for log in recent.reconcile(start, end, logs?) {
                self.tracker.observe(log).await?;
                observed += 1;
            }
            start = end + 1;
        }
        let summary = self.tracker.on_new_block(head).await?;
        self.advance_watermark(head).await?;
        info!(
            "[LedgerWatcher] backfill observed {} logs, processed {}",
            observed, summary.processed
        );
        Ok(Some(head))
    }

    async fn advance_watermark(&self, block: u64) -> LedgerResult<()> {
        self.store.set_last_processed_block(block).await?;
        self.metrics.last_processed_block.set(block as i64);
        Ok(())
    }

    /// Resolves once the watcher has been stopped or has halted on a fault.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("[LedgerWatcher] task ended abnormally: {:?}", e);
            }
        }
        info!("[LedgerWatcher] stopped");
    }
}

async fn run_consumer<S, H>(
    mut rx: mpsc::Receiver<ChainNotification>,
    store: Arc<S>,
    tracker: Arc<ConfirmationTracker<S, H>>,
    metrics: Arc<LedgerMetrics>,
    cancel: CancellationToken,
) where
    S: LedgerStore + 'static,
    H: ConfirmedEventHandler + 'static,
{
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            notification = rx.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };
        match notification {
            ChainNotification::Log(log) => {
                if let Err(e) = tracker.observe(log).await {
                    error!("[LedgerWatcher] failed to observe log: {}", e);
                }
            }
            ChainNotification::NewBlock(block) => match tracker.on_new_block(block).await {
                Ok(_) => {
                    if let Err(e) = store.set_last_processed_block(block).await {
                        error!("[LedgerWatcher] failed to store watermark {}: {}", block, e);
                        continue;
                    }
                    metrics.last_processed_block.set(block as i64);
                }
                Err(e) if e.is_ledger_fault() => {
                    error!("[LedgerWatcher] halting at block {}: {}", block, e);
                    cancel.cancel();
                    break;
                }
                Err(e) => warn!("[LedgerWatcher] block {} pass failed: {}", block, e),
            },
        }
    }
    info!("[LedgerWatcher] consumer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::ConfirmationConfig;
    use crate::error::LedgerError;
    use crate::store::MemoryStore;
    use crate::events::event_identity;
    use crate::test_utils::{event_record, pid, transfer_log, MockChainClient, RecordingHandler};
    use ethers::types::{H256, U256};
    use std::time::Duration;

    type TestWatcher = LedgerWatcher<MockChainClient, MemoryStore, RecordingHandler>;

    fn watcher(
        chain: Arc<MockChainClient>,
        store: Arc<MemoryStore>,
        handler: Arc<RecordingHandler>,
        start_block: u64,
    ) -> TestWatcher {
        watcher_with_depth(chain, store, handler, start_block, 2)
    }

    fn watcher_with_depth(
        chain: Arc<MockChainClient>,
        store: Arc<MemoryStore>,
        handler: Arc<RecordingHandler>,
        start_block: u64,
        required_confirmations: u64,
    ) -> TestWatcher {
        let metrics = Arc::new(LedgerMetrics::new_for_testing());
        let tracker = Arc::new(ConfirmationTracker::new(
            store.clone(),
            handler,
            ConfirmationConfig::default().with_required_confirmations(required_confirmations),
            metrics.clone(),
        ));
        let fetch = FetchConfig {
            max_block_range: 3,
            poll_interval: Duration::from_millis(10),
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
            ..Default::default()
        };
        LedgerWatcher::new(chain, store, tracker, fetch, start_block, metrics)
    }

    async fn wait_for_seen(handler: &RecordingHandler, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.seen().await.len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_backfill_then_follow_head() {
        let chain = MockChainClient::shared();
        chain.add_log(transfer_log(0, 1, 10, H256::repeat_byte(1), 5, 0));
        chain.add_log(transfer_log(0, 2, 10, H256::repeat_byte(2), 9, 0));
        chain.set_latest_block(10);
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher(chain.clone(), store.clone(), handler.clone(), 0);

        watcher.start().await.unwrap();
        // block 9 only has one confirmation at head 10
        assert_eq!(handler.seen().await.len(), 1);
        assert_eq!(store.last_processed_block().await.unwrap(), Some(10));

        chain.add_log(transfer_log(0, 3, 10, H256::repeat_byte(3), 12, 0));
        chain.set_latest_block(14);
        wait_for_seen(&handler, 3).await;
        let blocks: Vec<u64> = handler.seen().await.iter().map(|s| s.0).collect();
        assert_eq!(blocks, vec![5, 9, 12]);

        watcher.stop().await;
        assert!(watcher.is_stopped());
        assert_eq!(store.last_processed_block().await.unwrap(), Some(14));
    }

    #[tokio::test]
    async fn test_backfill_resumes_after_watermark() {
        let chain = MockChainClient::shared();
        // below the re-read window of watermark 6 at depth 2
        chain.add_log(transfer_log(0, 1, 10, H256::repeat_byte(1), 4, 0));
        chain.add_log(transfer_log(0, 2, 10, H256::repeat_byte(2), 8, 0));
        chain.set_latest_block(20);
        let store = Arc::new(MemoryStore::new());
        store.set_last_processed_block(6).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher(chain, store.clone(), handler.clone(), 0);

        watcher.start().await.unwrap();
        let seen = handler.seen().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, H256::repeat_byte(2));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_ledger_fault_during_backfill_fails_start() {
        let chain = MockChainClient::shared();
        chain.add_log(transfer_log(0, 1, 10, H256::repeat_byte(1), 5, 0));
        chain.set_latest_block(10);
        let fault = LedgerError::InsufficientBalance {
            pledge: pid(1),
            needed: U256::from(10),
            available: U256::zero(),
            tx_hash: H256::repeat_byte(1),
        };
        let handler = Arc::new(RecordingHandler::failing_on(H256::repeat_byte(1), fault.clone()));
        let watcher = watcher(chain, Arc::new(MemoryStore::new()), handler, 0);
        assert_eq!(watcher.start().await.unwrap_err(), fault);
    }

    #[tokio::test]
    async fn test_ledger_fault_while_following_halts() {
        let chain = MockChainClient::shared();
        chain.set_latest_block(10);
        let fault = LedgerError::MissingPledge(pid(4));
        let handler = Arc::new(RecordingHandler::failing_on(H256::repeat_byte(4), fault));
        let watcher = watcher(chain.clone(), Arc::new(MemoryStore::new()), handler, 0);
        watcher.start().await.unwrap();

        chain.add_log(transfer_log(0, 4, 10, H256::repeat_byte(4), 11, 0));
        chain.set_latest_block(13);
        tokio::time::timeout(Duration::from_secs(5), watcher.stopped())
            .await
            .unwrap();
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_log_reorged_out_before_confirmation_is_never_dispatched() {
        let chain = MockChainClient::shared();
        let orphaned = transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 0);
        chain.add_log(orphaned.clone());
        chain.set_latest_block(100);
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with_depth(chain.clone(), store.clone(), handler.clone(), 95, 3);
        watcher.start().await.unwrap();
        let identity = event_identity(&orphaned);
        assert!(store.get_event(&identity).await.unwrap().is_some());

        // the fork the chain settles on carries another transfer instead
        chain.drop_logs_of(H256::repeat_byte(1));
        chain.add_log(transfer_log(0, 2, 10, H256::repeat_byte(2), 102, 0));
        chain.set_latest_block(104);
        tokio::time::sleep(Duration::from_millis(50)).await;
        chain.set_latest_block(106);
        wait_for_seen(&handler, 1).await;
        watcher.stop().await;

        assert_eq!(
            handler.seen().await,
            vec![(102, 0, H256::repeat_byte(2))]
        );
        assert!(store.get_event(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_moved_log_is_dispatched_at_its_new_block() {
        let chain = MockChainClient::shared();
        chain.add_log(transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 0));
        chain.set_latest_block(100);
        let handler = Arc::new(RecordingHandler::default());
        let watcher =
            watcher_with_depth(chain.clone(), Arc::new(MemoryStore::new()), handler.clone(), 95, 3);
        watcher.start().await.unwrap();

        chain.drop_logs_of(H256::repeat_byte(1));
        chain.add_log(transfer_log(0, 1, 10, H256::repeat_byte(1), 101, 0));
        chain.set_latest_block(104);
        wait_for_seen(&handler, 1).await;
        watcher.stop().await;

        assert_eq!(handler.seen().await, vec![(101, 0, H256::repeat_byte(1))]);
    }

    #[tokio::test]
    async fn test_restart_drops_stored_events_missing_from_the_chain() {
        let chain = MockChainClient::shared();
        chain.set_latest_block(10);
        let store = Arc::new(MemoryStore::new());
        let stale = event_record(H256::repeat_byte(9), 9, 0);
        store.put_event(stale.clone()).await.unwrap();
        store.set_last_processed_block(10).await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher(chain, store.clone(), handler.clone(), 0);

        watcher.start().await.unwrap();
        watcher.stop().await;
        assert!(store.get_event(&stale.identity).await.unwrap().is_none());
        assert!(handler.seen().await.is_empty());
    }
}
