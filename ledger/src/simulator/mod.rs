// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Offline replay of the full event history against a scratch ledger, and
//! reconciliation of the persisted donations with the result.
//!
//! ```text
//!   NetworkCache ──(miss / --update-network-cache)──► NetworkFetcher
//!        │                                                 │
//!        ▼                                                 ▼
//!   NetworkState + events ◄───────── append-only ──────────┘
//!        │
//!        ▼
//!   scratch MemoryStore + LedgerReconciler(SnapshotSource)
//!        │  replay in (block, log_index) order through EventDispatcher
//!        ▼
//!   diff vs persisted store ─► orphans / mismatches / missing
//!   conservation per pledge, entity aggregates ─► SimulationReport
//! ```

pub mod aggregates;
mod cache;
mod diff;
mod fetch;


pub use cache::{NetworkCache, NetworkState, SnapshotSource};
pub use diff::{diff_donations, DonationMismatch, LedgerDiff};
pub use fetch::{CircuitBreaker, NetworkFetcher};

use crate::chain_client::ChainClient;
use crate::config::LedgerNodeConfig;
use crate::error::LedgerResult;
use crate::handlers::EventDispatcher;
use crate::metrics::LedgerMetrics;
use crate::rates::{RateProvider, StaticRates, TokenRegistry};
use crate::reconciler::{ConservationViolation, FaultPolicy, LedgerFault, LedgerReconciler};
use crate::store::{LedgerStore, MemoryStore, StoreState};
use crate::types::{Donation, DonationId, RawLog};
use aggregates::aggregate_entity;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorOptions {
    /// Write corrections back to the persisted store.
    pub fix: bool,
    /// Fetch new state and events even when a cache exists.
    pub update_cache: bool,
    pub policy: FaultPolicy,
}

impl SimulatorOptions {
    pub fn dry_run() -> Self {
        Self {
            fix: false,
            update_cache: false,
            policy: FaultPolicy::Advisory,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub environment: String,
    pub events_replayed: usize,
    pub replay_errors: usize,
    pub faults: Vec<LedgerFault>,
    pub orphans: Vec<DonationId>,
    pub mismatches: Vec<DonationMismatch>,
    pub missing: Vec<DonationId>,
    pub conservation_violations: Vec<ConservationViolation>,
    pub entities_updated: Vec<String>,
    pub fixed: bool,
}

pub struct Simulator<S, C> {
    environment: String,
    start_block: u64,
    tokens: TokenRegistry,
    rates: Arc<dyn RateProvider>,
    store: Arc<S>,
    fetcher: NetworkFetcher<C>,
    cache: NetworkCache,
    options: SimulatorOptions,
    metrics: Arc<LedgerMetrics>,
}

impl<S: LedgerStore, C: ChainClient + 'static> Simulator<S, C> {
    pub fn new(
        config: &LedgerNodeConfig,
        store: Arc<S>,
        client: Arc<C>,
        cache_dir: impl Into<PathBuf>,
        options: SimulatorOptions,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            environment: config.environment.clone(),
            start_block: config.start_block,
            tokens: TokenRegistry::new(config.tokens.clone()),
            rates: Arc::new(StaticRates::new(config.rates.clone())),
            store,
            fetcher: NetworkFetcher::new(client, config.fetch.clone(), metrics.clone()),
            cache: NetworkCache::new(cache_dir, config.environment.clone()),
            options,
            metrics,
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.cache.report_path()
    }

    /// Cached snapshot and history, refreshed from the network when the
    /// cache is missing or an update was requested.
    async fn load_network(&self) -> LedgerResult<(NetworkState, Vec<RawLog>)> {
        let cached = self.cache.load_state()?;
        match cached {
            Some(state) if !self.options.update_cache => {
                let events = self.cache.load_events()?;
                info!(
                    "[Simulator] using cached network state: {} pledges, {} admins, {} events",
                    state.pledges.len(),
                    state.admins.len(),
                    events.len()
                );
                Ok((state, events))
            }
            cached => {
                let from_block = cached
                    .and_then(|state| state.last_block)
                    .map(|block| block + 1)
                    .unwrap_or(self.start_block);
                let (state, new_events) = self.fetcher.fetch_all(from_block).await?;
                self.cache.save_state(&state)?;
                let events = self.cache.append_events(new_events)?;
                Ok((state, events))
            }
        }
    }

    pub async fn run(&self) -> LedgerResult<SimulationReport> {
        let (state, mut events) = self.load_network().await?;
        events.sort_by_key(|log| (log.block_number, log.log_index));

        let persisted = self.store.donations().await?;
        let entities = self.store.entities().await?;
        let scratch = Arc::new(MemoryStore::from_state(StoreState {
            entities: entities
                .iter()
                .map(|entity| (entity.id.clone(), entity.clone()))
                .collect(),
            ..Default::default()
        }));
        let source = Arc::new(SnapshotSource::new(&state));
        let reconciler = Arc::new(LedgerReconciler::new(
            scratch.clone(),
            source.clone(),
            self.tokens.clone(),
            self.rates.clone(),
            self.options.policy,
            self.metrics.clone(),
        ));
        reconciler.seed_candidates(persisted.clone()).await?;
        let dispatcher = EventDispatcher::new(
            scratch.clone(),
            source,
            reconciler.clone(),
            self.tokens.clone(),
            self.metrics.clone(),
        );

        let mut report = SimulationReport {
            environment: self.environment.clone(),
            ..Default::default()
        };
        for log in &events {
            match dispatcher.dispatch_log(log).await {
                Ok(()) => report.events_replayed += 1,
                Err(err) if err.is_ledger_fault() && self.options.policy == FaultPolicy::Strict => {
                    error!(
                        "[Simulator] halting replay at block={} log_index={} tx={:?}: {}",
                        log.block_number, log.log_index, log.transaction_hash, err
                    );
                    return Err(err);
                }
                Err(err) => {
                    report.replay_errors += 1;
                    warn!(
                        "[Simulator] event at block={} log_index={} tx={:?} not applied: {}",
                        log.block_number, log.log_index, log.transaction_hash, err
                    );
                }
            }
        }
        report.faults = reconciler.faults().await;

        let replayed = scratch.donations().await?;
        let used = reconciler.used_donations().await;
        let diff = diff_donations(&persisted, &replayed, &used);
        for id in &diff.orphans {
            warn!("[Simulator] orphan donation {}", id);
        }
        for mismatch in &diff.mismatches {
            warn!(
                "[Simulator] donation {} stored remaining={} status={} replayed remaining={} status={}",
                mismatch.id,
                mismatch.stored_remaining,
                mismatch.stored_status,
                mismatch.replayed_remaining,
                mismatch.replayed_status
            );
        }
        for id in &diff.missing {
            warn!("[Simulator] donation {} missing from store", id);
        }
        if self.options.fix {
            self.apply_fixes(&diff, &replayed).await?;
        }

        report.conservation_violations = reconciler.check_conservation(&state.pledges).await;
        for violation in &report.conservation_violations {
            warn!(
                "[Simulator] pledge {} holds {} on chain but {} is charged",
                violation.pledge, violation.expected, violation.charged
            );
        }

        let orphans: HashSet<DonationId> = diff.orphans.iter().copied().collect();
        let live: Vec<_> = replayed
            .into_iter()
            .filter(|donation| !orphans.contains(&donation.id))
            .collect();
        for mut entity in entities {
            let aggregate = aggregate_entity(&entity, &live, &self.tokens);
            if aggregate.apply_to(&mut entity) {
                warn!("[Simulator] counters of {} are stale", entity.id);
                report.entities_updated.push(entity.id.clone());
                if self.options.fix {
                    self.store.put_entity(entity).await?;
                }
            }
        }

        self.record_diff_metrics(&diff, &report);
        report.orphans = diff.orphans;
        report.mismatches = diff.mismatches;
        report.missing = diff.missing;
        report.fixed = self.options.fix;
        let path = self.cache.write_report(&report)?;
        info!(
            "[Simulator] replayed {} events ({} errors, {} faults), report at {}",
            report.events_replayed,
            report.replay_errors,
            report.faults.len(),
            path.display()
        );
        Ok(report)
    }

    async fn apply_fixes(&self, diff: &LedgerDiff, replayed: &[Donation]) -> LedgerResult<()> {
        let by_id: HashMap<DonationId, _> = replayed.iter().map(|d| (d.id, d)).collect();
        for id in &diff.orphans {
            self.store.delete_donation(*id).await?;
        }
        let rewrites = diff
            .mismatches
            .iter()
            .map(|m| m.id)
            .chain(diff.missing.iter().copied());
        for id in rewrites {
            if let Some(donation) = by_id.get(&id) {
                self.store.put_donation((*donation).clone()).await?;
            }
        }
        info!(
            "[Simulator] fixed store: {} deleted, {} overwritten, {} created",
            diff.orphans.len(),
            diff.mismatches.len(),
            diff.missing.len()
        );
        Ok(())
    }

    fn record_diff_metrics(&self, diff: &LedgerDiff, report: &SimulationReport) {
        for (kind, count) in [
            ("orphan", diff.orphans.len()),
            ("mismatch", diff.mismatches.len()),
            ("missing", diff.missing.len()),
            ("conservation", report.conservation_violations.len()),
            ("aggregate", report.entities_updated.len()),
        ] {
            self.metrics
                .simulator_diffs
                .with_label_values(&[kind])
                .inc_by(count as u64);
        }
    }
}
