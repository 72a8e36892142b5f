// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

const RPC_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20., 30.,
    60.,
];

#[derive(Clone, Debug)]
pub struct LedgerMetrics {
    pub(crate) events_observed: IntCounterVec,
    pub(crate) events_confirmed: IntCounterVec,
    pub(crate) events_processed: IntCounterVec,
    pub(crate) events_failed: IntCounterVec,
    pub(crate) events_pending_confirmation: IntGauge,
    pub(crate) handler_errors: IntCounterVec,
    pub(crate) reorg_anomalies: IntCounter,
    pub(crate) ledger_faults: IntCounterVec,
    pub(crate) last_processed_block: IntGauge,

    pub(crate) donations_created: IntCounter,
    pub(crate) donations_matched: IntCounter,
    pub(crate) unmatched_payments: IntCounter,

    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,
    pub(crate) fetch_retries: IntCounterVec,

    pub(crate) simulator_diffs: IntCounterVec,
}

impl LedgerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            events_observed: register_int_counter_vec_with_registry!(
                "ledger_events_observed",
                "Total number of raw chain logs observed, by event name",
                &["event"],
                registry,
            )
            .unwrap(),
            events_confirmed: register_int_counter_vec_with_registry!(
                "ledger_events_confirmed",
                "Total number of events that reached the required confirmation depth",
                &["event"],
                registry,
            )
            .unwrap(),
            events_processed: register_int_counter_vec_with_registry!(
                "ledger_events_processed",
                "Total number of confirmed events handled successfully",
                &["event"],
                registry,
            )
            .unwrap(),
            events_failed: register_int_counter_vec_with_registry!(
                "ledger_events_failed",
                "Total number of confirmed events whose handler failed",
                &["event"],
                registry,
            )
            .unwrap(),
            events_pending_confirmation: register_int_gauge_with_registry!(
                "ledger_events_pending_confirmation",
                "Number of observed events waiting for confirmations",
                registry,
            )
            .unwrap(),
            handler_errors: register_int_counter_vec_with_registry!(
                "ledger_handler_errors",
                "Handler errors by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            reorg_anomalies: register_int_counter_with_registry!(
                "ledger_reorg_anomalies",
                "Confirmed events that changed after confirmation",
                registry,
            )
            .unwrap(),
            ledger_faults: register_int_counter_vec_with_registry!(
                "ledger_consistency_faults",
                "Ledger consistency faults by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            last_processed_block: register_int_gauge_with_registry!(
                "ledger_last_processed_block",
                "Latest block passed to the confirmation tracker",
                registry,
            )
            .unwrap(),
            donations_created: register_int_counter_with_registry!(
                "ledger_donations_created",
                "Donations synthesized from transfers without a matching record",
                registry,
            )
            .unwrap(),
            donations_matched: register_int_counter_with_registry!(
                "ledger_donations_matched",
                "Transfers matched onto a pending donation record",
                registry,
            )
            .unwrap(),
            unmatched_payments: register_int_counter_with_registry!(
                "ledger_unmatched_payments",
                "Payment authorizations without a paying donation",
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "ledger_rpc_queries",
                "Total number of chain rpc queries by method",
                &["method"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "ledger_rpc_queries_latency",
                "Latency of chain rpc queries by method",
                &["method"],
                RPC_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            fetch_retries: register_int_counter_vec_with_registry!(
                "ledger_fetch_retries",
                "Retried batch fetch operations by operation",
                &["operation"],
                registry,
            )
            .unwrap(),
            simulator_diffs: register_int_counter_vec_with_registry!(
                "ledger_simulator_diffs",
                "Differences between replayed and stored ledger, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

/// Serves the registry in text format at `/metrics`.
pub fn start_metrics_server(address: SocketAddr, registry: Registry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(registry);
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("[Metrics] failed to bind {}: {:?}", address, e);
                return;
            }
        };
        info!("[Metrics] serving on {}", address);
        if let Err(e) = axum::serve(listener, app).await {
            error!("[Metrics] server stopped: {:?}", e);
        }
    })
}

async fn render_metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_on_shared_registry() {
        let registry = Registry::new();
        let metrics = LedgerMetrics::new(&registry);
        metrics
            .events_observed
            .with_label_values(&["Transfer"])
            .inc();
        metrics.reorg_anomalies.inc();
        let names: Vec<_> = registry
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"ledger_events_observed".to_string()));
        assert!(names.contains(&"ledger_reorg_anomalies".to_string()));
    }

    #[tokio::test]
    async fn test_render_metrics_text() {
        let registry = Registry::new();
        let metrics = LedgerMetrics::new(&registry);
        metrics.last_processed_block.set(42);
        let (status, body) = render_metrics(State(registry)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ledger_last_processed_block 42"));
    }
}
