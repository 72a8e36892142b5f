// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batch reads of the full pledge/admin snapshot and event history.

use super::cache::NetworkState;
use crate::chain_client::ChainClient;
use crate::config::FetchConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::LedgerMetrics;
use crate::retry_with_max_attempts;
use crate::types::{PledgeId, RawLog};
use futures::{StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after `threshold` consecutive failed operations and rejects calls
/// until `cooldown` has elapsed. The first call after the cooldown is a
/// trial; one more failure opens it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub async fn check(&self) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let Some(opened_at) = state.opened_at else {
            return Ok(());
        };
        let elapsed = opened_at.elapsed();
        if elapsed < self.cooldown {
            let remaining = self.cooldown - elapsed;
            return Err(LedgerError::CircuitOpen {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }
        state.opened_at = None;
        state.consecutive_failures = self.threshold - 1;
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            warn!(
                "[CircuitBreaker] open after {} consecutive failures",
                state.consecutive_failures
            );
            state.opened_at = Some(Instant::now());
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.opened_at.is_some()
    }
}

pub struct NetworkFetcher<C> {
    client: Arc<C>,
    config: FetchConfig,
    breaker: CircuitBreaker,
    metrics: Arc<LedgerMetrics>,
}

impl<C: ChainClient + 'static> NetworkFetcher<C> {
    pub fn new(client: Arc<C>, config: FetchConfig, metrics: Arc<LedgerMetrics>) -> Self {
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_cooldown_secs),
        );
        Self {
            client,
            config,
            breaker,
            metrics,
        }
    }

    /// One logical operation: breaker check, bounded retries, breaker update.
    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> LedgerResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        self.breaker.check().await?;
        let (result, attempts) = retry_with_max_attempts!(f(), &self.config);
        if attempts > 1 {
            self.metrics
                .fetch_retries
                .with_label_values(&[operation])
                .inc_by(u64::from(attempts - 1));
        }
        match result {
            Ok(value) => {
                self.breaker.record_success().await;
                Ok(value)
            }
            Err(err) => {
                warn!("[NetworkFetcher] {} failed: {}", operation, err);
                if err.category() == crate::error::ErrorCategory::Connectivity {
                    self.breaker.record_failure().await;
                }
                Err(err)
            }
        }
    }

    pub async fn latest_block(&self) -> LedgerResult<u64> {
        let client = self.client.clone();
        self.run("latest_block", || {
            let client = client.clone();
            async move { client.latest_block().await }
        })
        .await
    }

    /// Every pledge and admin, read with bounded concurrency.
    pub async fn fetch_state(&self) -> LedgerResult<NetworkState> {
        let client = self.client.clone();
        let pledge_count = self
            .run("number_of_pledges", || {
                let client = client.clone();
                async move { client.number_of_pledges().await }
            })
            .await?;
        let admin_count = self
            .run("number_of_pledge_admins", || {
                let client = client.clone();
                async move { client.number_of_pledge_admins().await }
            })
            .await?;
        let concurrency = self.config.concurrency.max(1);

        let pledges = futures::stream::iter((1..=pledge_count).filter_map(PledgeId::new))
            .map(|id| {
                let client = client.clone();
                async move {
                    self.run("get_pledge", || {
                        let client = client.clone();
                        async move { client.pledge(id).await }
                    })
                    .await
                }
            })
            .buffered(concurrency)
            .try_collect::<Vec<_>>();
        let admins = futures::stream::iter(1..=admin_count)
            .map(|id| {
                let client = client.clone();
                async move {
                    self.run("get_pledge_admin", || {
                        let client = client.clone();
                        async move { client.pledge_admin(id).await }
                    })
                    .await
                }
            })
            .buffered(concurrency)
            .try_collect::<Vec<_>>();
        let (pledges, admins) = tokio::try_join!(pledges, admins)?;
        info!(
            "[NetworkFetcher] fetched {} pledges and {} admins",
            pledges.len(),
            admins.len()
        );
        Ok(NetworkState {
            pledges,
            admins,
            last_block: None,
        })
    }

    /// Logs in `[from_block, to_block]`, chunked by `max_block_range`.
    pub async fn fetch_events(&self, from_block: u64, to_block: u64) -> LedgerResult<Vec<RawLog>> {
        let client = self.client.clone();
        let range = self.config.max_block_range.max(1);
        let mut logs = vec![];
        let mut start = from_block;
        while start <= to_block {
            let end = to_block.min(start.saturating_add(range - 1));
            let chunk = self
                .run("past_logs", || {
                    let client = client.clone();
                    async move { client.past_logs(start, end).await }
                })
                .await?;
            logs.extend(chunk.into_iter().filter(|log| !log.removed));
            start = end + 1;
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    /// Snapshot and new events since `from_block`, fetched concurrently.
    pub async fn fetch_all(&self, from_block: u64) -> LedgerResult<(NetworkState, Vec<RawLog>)> {
        let latest = self.latest_block().await?;
        let (mut state, events) =
            tokio::try_join!(self.fetch_state(), self.fetch_events(from_block, latest))?;
        state.last_block = Some(latest);
        info!(
            "[NetworkFetcher] {} new events in [{}, {}]",
            events.len(),
            from_block,
            latest
        );
        Ok((state, events))
    }
}
