// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use pledge_ledger::chain_client::EthChainClient;
use pledge_ledger::config::LedgerNodeConfig;
use pledge_ledger::confirmation::ConfirmationTracker;
use pledge_ledger::handlers::EventDispatcher;
use pledge_ledger::metrics::{start_metrics_server, LedgerMetrics};
use pledge_ledger::rates::{StaticRates, TokenRegistry};
use pledge_ledger::reconciler::LedgerReconciler;
use pledge_ledger::store::MemoryStore;
use pledge_ledger::watcher::LedgerWatcher;
use pledge_ledger_config::Config;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STORE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = LedgerNodeConfig::load(&args.config_path)?;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(LedgerMetrics::new(&registry));
    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let _metrics_handle = start_metrics_server(metrics_address, registry);
    info!("Metrics server started at port {}", config.metrics_port);

    let client = Arc::new(EthChainClient::new_http(
        &config.rpc_url,
        config.liquid_pledging_address,
        config.watched_addresses(),
        metrics.clone(),
    )?);
    let store = Arc::new(
        MemoryStore::open(&config.store_path)
            .with_context(|| format!("opening store {}", config.store_path.display()))?,
    );
    let tokens = TokenRegistry::new(config.tokens.clone());
    let reconciler = Arc::new(LedgerReconciler::new(
        store.clone(),
        client.clone(),
        tokens.clone(),
        Arc::new(StaticRates::new(config.rates.clone())),
        config.fault_policy,
        metrics.clone(),
    ));
    reconciler.load_from_store().await?;
    let dispatcher = Arc::new(EventDispatcher::new(
        store.clone(),
        client.clone(),
        reconciler,
        tokens,
        metrics.clone(),
    ));
    let tracker = Arc::new(ConfirmationTracker::new(
        store.clone(),
        dispatcher,
        config.confirmation.clone(),
        metrics.clone(),
    ));
    let watcher = LedgerWatcher::new(
        client,
        store.clone(),
        tracker,
        config.fetch.clone(),
        config.start_block,
        metrics,
    );

    let cancel = CancellationToken::new();
    let flush = tokio::spawn(flush_store(store.clone(), cancel.child_token()));

    let started = watcher.start().await;
    let halted = match &started {
        Ok(()) => {
            let halted = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received ctrl-c, shutting down");
                    false
                }
                _ = watcher.stopped() => true,
            };
            watcher.stop().await;
            halted
        }
        Err(e) => {
            error!("Ledger watcher failed to start: {}", e);
            true
        }
    };

    cancel.cancel();
    let _ = flush.await;
    store.save().await?;
    info!("Store saved to {}", config.store_path.display());
    started?;
    if halted {
        anyhow::bail!("ledger watcher halted");
    }
    Ok(())
}

async fn flush_store(store: Arc<MemoryStore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STORE_FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = store.save().await {
                    error!("Failed to save store: {}", e);
                }
            }
        }
    }
}
