// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::ConfirmationConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{event_identity, LedgerEvent};
use crate::metrics::LedgerMetrics;
use crate::sequential_queue::SequentialEventQueue;
use crate::store::LedgerStore;
use crate::types::{EventRecord, EventStatus, RawLog};
use async_trait::async_trait;
use ethers::types::H256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Receives events once they reach the confirmation depth.
#[async_trait]
pub trait ConfirmedEventHandler: Send + Sync {
    async fn handle(&self, event: &EventRecord) -> LedgerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    Created,
    /// Same log seen at a new position, confirmations adjusted.
    Merged,
    /// Duplicate delivery, nothing changed.
    Unchanged,
    /// Removed by a shallow reorg before confirmation.
    Removed,
    /// Removal of a log we never stored.
    Ignored,
    /// A confirmed event changed, see [`LedgerError::ReorgAnomaly`].
    Anomaly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub confirmed: usize,
    pub processed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

pub struct ConfirmationTracker<S, H> {
    store: Arc<S>,
    handler: Arc<H>,
    queue: SequentialEventQueue<H256>,
    config: ConfirmationConfig,
    metrics: Arc<LedgerMetrics>,
    /// Serializes block passes so dispatch order follows block order.
    dispatch_lock: Mutex<()>,
}

impl<S, H> ConfirmationTracker<S, H>
where
    S: LedgerStore + 'static,
    H: ConfirmedEventHandler + 'static,
{
    pub fn new(
        store: Arc<S>,
        handler: Arc<H>,
        config: ConfirmationConfig,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        info!(
            "[ConfirmationTracker] required_confirmations={}",
            config.required_confirmations
        );
        Self {
            store,
            handler,
            queue: SequentialEventQueue::new(),
            config,
            metrics,
            dispatch_lock: Mutex::new(()),
        }
    }

    pub fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations
    }

    /// Records a raw log. Concurrent deliveries of the same log are
    /// serialized on its identity.
    pub async fn observe(&self, log: RawLog) -> LedgerResult<ObserveOutcome> {
        let identity = event_identity(&log);
        let block_number = log.block_number;
        let (tx, rx) = oneshot::channel();
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        self.queue
            .add(identity, async move {
                let result = apply_observation(store.as_ref(), &metrics, identity, log).await;
                let _ = tx.send(result);
            })
            .await;
        let outcome = rx.await.map_err(|_| {
            LedgerError::Storage(format!("observation of {:?} was dropped", identity))
        })??;

        if outcome == ObserveOutcome::Created && self.config.dispatches_immediately() {
            self.on_new_block(block_number).await?;
        }
        Ok(outcome)
    }

    /// Re-buckets every undispatched event against head `block_number` and
    /// dispatches the ones at the required depth.
    ///
    /// Returns the first ledger-consistency error raised by the handler,
    /// after which no further events of this pass are dispatched. Other
    /// handler errors mark the event failed and the pass continues.
    pub async fn on_new_block(&self, block_number: u64) -> LedgerResult<DispatchSummary> {
        let _guard = self.dispatch_lock.lock().await;
        let required = self.config.required_confirmations;
        let mut summary = DispatchSummary::default();

        let mut ready = vec![];
        let mut buckets: BTreeMap<u64, Vec<EventRecord>> = BTreeMap::new();
        for event in self.store.undispatched_events().await? {
            if event.confirmed {
                ready.push(event);
                continue;
            }
            let depth = block_number.saturating_sub(event.block_number).min(required);
            buckets.entry(depth).or_default().push(event);
        }

        for mut event in buckets.remove(&required).unwrap_or_default() {
            event.confirmations = required;
            event.confirmed = true;
            event.status = EventStatus::Waiting;
            self.metrics
                .events_confirmed
                .with_label_values(&[&event.event])
                .inc();
            self.store.put_event(event.clone()).await?;
            summary.confirmed += 1;
            ready.push(event);
        }

        for (depth, events) in buckets {
            for mut event in events {
                summary.still_pending += 1;
                if event.confirmations != depth {
                    event.confirmations = depth;
                    self.store.put_event(event).await?;
                }
            }
        }
        self.metrics
            .events_pending_confirmation
            .set(summary.still_pending as i64);

        ready.sort_by_key(|e| e.position());
        for mut event in ready {
            event.status = EventStatus::Processing;
            self.store.put_event(event.clone()).await?;

            match self.handler.handle(&event).await {
                Ok(()) => {
                    debug!(
                        "[ConfirmationTracker] processed {} tx={:?} log_index={}",
                        event.event, event.transaction_hash, event.log_index
                    );
                    event.status = EventStatus::Processed;
                    event.processing_error = None;
                    self.store.put_event(event.clone()).await?;
                    self.metrics
                        .events_processed
                        .with_label_values(&[&event.event])
                        .inc();
                    summary.processed += 1;
                }
                Err(err) => {
                    error!(
                        "[ConfirmationTracker] handler failed for {} tx={:?} log_index={}: {}",
                        event.event, event.transaction_hash, event.log_index, err
                    );
                    event.status = EventStatus::Failed;
                    event.processing_error = Some(err.to_string());
                    self.store.put_event(event.clone()).await?;
                    self.metrics
                        .events_failed
                        .with_label_values(&[&event.event])
                        .inc();
                    self.metrics
                        .handler_errors
                        .with_label_values(&[err.error_type()])
                        .inc();
                    summary.failed += 1;
                    if err.is_ledger_fault() {
                        return Err(err);
                    }
                }
            }
        }

        if summary.confirmed > 0 || summary.failed > 0 {
            info!(
                "[ConfirmationTracker] block {}: confirmed={} processed={} failed={} pending={}",
                block_number,
                summary.confirmed,
                summary.processed,
                summary.failed,
                summary.still_pending
            );
        }
        Ok(summary)
    }

    pub async fn is_observing(&self, identity: &H256) -> bool {
        self.queue.is_processing(identity).await
    }
}

async fn apply_observation<S: LedgerStore>(
    store: &S,
    metrics: &LedgerMetrics,
    identity: H256,
    log: RawLog,
) -> LedgerResult<ObserveOutcome> {
    let decoded = LedgerEvent::decode(&log.topics, &log.data)?;
    let name = decoded.name();
    metrics.events_observed.with_label_values(&[&name]).inc();

    let Some(mut existing) = store.get_event(&identity).await? else {
        if log.removed {
            debug!(
                "[ConfirmationTracker] ignoring removal of unknown log {:?}",
                identity
            );
            return Ok(ObserveOutcome::Ignored);
        }
        store
            .put_event(EventRecord {
                identity,
                address: log.address,
                transaction_hash: log.transaction_hash,
                transaction_index: log.transaction_index,
                block_number: log.block_number,
                block_hash: log.block_hash,
                log_index: log.log_index,
                transaction_log_index: log.transaction_log_index,
                topics: log.topics,
                data: log.data,
                event: name,
                return_values: decoded.return_values(),
                confirmations: 0,
                confirmed: false,
                status: EventStatus::Pending,
                processing_error: None,
            })
            .await?;
        return Ok(ObserveOutcome::Created);
    };

    let moved = existing.block_number != log.block_number
        || existing.block_hash != log.block_hash
        || existing.log_index != log.log_index
        || existing.transaction_index != log.transaction_index;

    if existing.confirmed {
        if !moved && !log.removed {
            return Ok(ObserveOutcome::Unchanged);
        }
        let anomaly = LedgerError::ReorgAnomaly {
            identity,
            detail: if log.removed {
                format!("log removed at block {}", log.block_number)
            } else {
                format!(
                    "moved from block {} (log {}) to block {} (log {})",
                    existing.block_number, existing.log_index, log.block_number, log.log_index
                )
            },
        };
        error!(
            "[ConfirmationTracker] {} event={} tx={:?}",
            anomaly, existing.event, existing.transaction_hash
        );
        metrics.reorg_anomalies.inc();
        if !log.removed {
            existing.block_number = log.block_number;
            existing.block_hash = log.block_hash;
            existing.log_index = log.log_index;
            existing.transaction_index = log.transaction_index;
            existing.confirmations = 0;
            existing.confirmed = false;
            existing.status = EventStatus::Pending;
            existing.processing_error = Some(anomaly.to_string());
            store.put_event(existing).await?;
        }
        return Ok(ObserveOutcome::Anomaly);
    }

    if log.removed {
        warn!(
            "[ConfirmationTracker] unconfirmed {} tx={:?} removed by reorg",
            existing.event, existing.transaction_hash
        );
        store.remove_event(&identity).await?;
        return Ok(ObserveOutcome::Removed);
    }
    if !moved {
        return Ok(ObserveOutcome::Unchanged);
    }

    let delta = log.block_number as i128 - existing.block_number as i128;
    existing.confirmations = (existing.confirmations as i128 - delta).max(0) as u64;
    existing.block_number = log.block_number;
    existing.block_hash = log.block_hash;
    existing.log_index = log.log_index;
    existing.transaction_index = log.transaction_index;
    store.put_event(existing).await?;
    Ok(ObserveOutcome::Merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{event_record, transfer_log, RecordingHandler};
    use ethers::types::H256;

    fn tracker(
        required: u64,
        handler: Arc<RecordingHandler>,
    ) -> (Arc<MemoryStore>, ConfirmationTracker<MemoryStore, RecordingHandler>) {
        let store = Arc::new(MemoryStore::new());
        let tracker = ConfirmationTracker::new(
            store.clone(),
            handler,
            ConfirmationConfig::default().with_required_confirmations(required),
            Arc::new(LedgerMetrics::new_for_testing()),
        );
        (store, tracker)
    }

    #[tokio::test]
    async fn test_events_dispatch_at_required_depth_in_chain_order() {
        let handler = Arc::new(RecordingHandler::default());
        let (store, tracker) = tracker(3, handler.clone());

        let late = transfer_log(1, 2, 10, H256::repeat_byte(2), 101, 0);
        let early_second = transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 5);
        let early_first = transfer_log(0, 3, 10, H256::repeat_byte(3), 100, 1);
        for log in [late.clone(), early_second.clone(), early_first.clone()] {
            assert_eq!(tracker.observe(log).await.unwrap(), ObserveOutcome::Created);
        }

        let summary = tracker.on_new_block(102).await.unwrap();
        assert_eq!(summary.confirmed, 0);
        assert_eq!(summary.still_pending, 3);
        let pending = store
            .get_event(&event_identity(&early_first))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.confirmations, 2);

        let summary = tracker.on_new_block(103).await.unwrap();
        assert_eq!(summary.confirmed, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(
            handler.seen().await,
            vec![
                (100, 1, H256::repeat_byte(3)),
                (100, 5, H256::repeat_byte(1))
            ]
        );

        // Far-ahead head is capped at the required depth.
        let summary = tracker.on_new_block(500).await.unwrap();
        assert_eq!(summary.confirmed, 1);
        let done = store.get_event(&event_identity(&late)).await.unwrap().unwrap();
        assert!(done.confirmed);
        assert_eq!(done.confirmations, 3);
        assert_eq!(done.status, EventStatus::Processed);
    }

    #[tokio::test]
    async fn test_zero_confirmations_dispatch_immediately() {
        let handler = Arc::new(RecordingHandler::default());
        let (_store, tracker) = tracker(0, handler.clone());
        tracker
            .observe(transfer_log(0, 1, 10, H256::repeat_byte(9), 7, 0))
            .await
            .unwrap();
        assert_eq!(handler.seen().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_moved_deliveries_merge() {
        let handler = Arc::new(RecordingHandler::default());
        let (store, tracker) = tracker(5, handler.clone());
        let log = transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 0);
        tracker.observe(log.clone()).await.unwrap();
        tracker.on_new_block(103).await.unwrap();
        assert_eq!(
            tracker.observe(log.clone()).await.unwrap(),
            ObserveOutcome::Unchanged
        );

        let mut moved = log.clone();
        moved.block_number = 102;
        moved.block_hash = H256::repeat_byte(0xbb);
        assert_eq!(
            tracker.observe(moved.clone()).await.unwrap(),
            ObserveOutcome::Merged
        );
        let event = store.get_event(&event_identity(&log)).await.unwrap().unwrap();
        assert_eq!(event.block_number, 102);
        assert_eq!(event.confirmations, 1);

        let mut removed = moved;
        removed.removed = true;
        assert_eq!(
            tracker.observe(removed).await.unwrap(),
            ObserveOutcome::Removed
        );
        assert!(store.get_event(&event_identity(&log)).await.unwrap().is_none());
        tracker.on_new_block(200).await.unwrap();
        assert!(handler.seen().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconfirmed_unchanged_event_is_noop() {
        let handler = Arc::new(RecordingHandler::default());
        let (_store, tracker) = tracker(1, handler.clone());
        let log = transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 0);
        tracker.observe(log.clone()).await.unwrap();
        tracker.on_new_block(101).await.unwrap();
        assert_eq!(
            tracker.observe(log).await.unwrap(),
            ObserveOutcome::Unchanged
        );
        tracker.on_new_block(102).await.unwrap();
        assert_eq!(handler.seen().await.len(), 1);
    }

    #[tokio::test]
    async fn test_event_left_processing_is_dispatched_after_restart() {
        let handler = Arc::new(RecordingHandler::default());
        let (store, tracker) = tracker(2, handler.clone());
        let mut interrupted = event_record(H256::repeat_byte(7), 50, 0);
        interrupted.confirmed = true;
        interrupted.confirmations = 2;
        interrupted.status = EventStatus::Processing;
        store.put_event(interrupted.clone()).await.unwrap();

        let summary = tracker.on_new_block(60).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(handler.seen().await, vec![(50, 0, H256::repeat_byte(7))]);
        let stored = store.get_event(&interrupted.identity).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
    }

    #[tokio::test]
    async fn test_changed_confirmed_event_is_an_anomaly() {
        let handler = Arc::new(RecordingHandler::default());
        let metrics = Arc::new(LedgerMetrics::new_for_testing());
        let store = Arc::new(MemoryStore::new());
        let tracker = ConfirmationTracker::new(
            store.clone(),
            handler.clone(),
            ConfirmationConfig::default().with_required_confirmations(1),
            metrics.clone(),
        );
        let log = transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 0);
        tracker.observe(log.clone()).await.unwrap();
        tracker.on_new_block(101).await.unwrap();

        let mut reorged = log.clone();
        reorged.block_number = 104;
        reorged.block_hash = H256::repeat_byte(0xcc);
        assert_eq!(
            tracker.observe(reorged).await.unwrap(),
            ObserveOutcome::Anomaly
        );
        assert_eq!(metrics.reorg_anomalies.get(), 1);
        let event = store.get_event(&event_identity(&log)).await.unwrap().unwrap();
        assert!(!event.confirmed);
        assert!(event.processing_error.unwrap().contains("moved from block 100"));

        // Reprocessed once the new position is deep enough.
        tracker.on_new_block(105).await.unwrap();
        assert_eq!(handler.seen().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ledger_fault_stops_the_pass() {
        let handler = Arc::new(RecordingHandler::failing_on(
            H256::repeat_byte(1),
            LedgerError::MissingPledgeAdmin(4),
        ));
        let (store, tracker) = tracker(0, handler.clone());
        tracker
            .observe(transfer_log(0, 1, 10, H256::repeat_byte(1), 100, 0))
            .await
            .unwrap_err();
        let failed = store
            .get_event(&event_identity(&transfer_log(
                0,
                1,
                10,
                H256::repeat_byte(1),
                100,
                0,
            )))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, EventStatus::Failed);
        assert!(failed.processing_error.is_some());
    }
}
