// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Offline simulator: replays the full pledge history and reconciles the
//! stored donation ledger with it.

use anyhow::Context;
use clap::Parser;
use pledge_ledger::chain_client::EthChainClient;
use pledge_ledger::config::LedgerNodeConfig;
use pledge_ledger::metrics::LedgerMetrics;
use pledge_ledger::simulator::{Simulator, SimulatorOptions};
use pledge_ledger::store::MemoryStore;
use pledge_ledger_config::Config;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version)]
struct Args {
    #[clap(long)]
    config_path: PathBuf,
    /// Report differences without writing fixes; ledger faults are recorded
    /// instead of halting.
    #[clap(long)]
    dry_run: bool,
    /// Fetch new network state and events even when a cache exists.
    #[clap(long)]
    update_network_cache: bool,
    #[clap(long, default_value = "./cache")]
    cache_dir: PathBuf,
    /// Also write logs to `<log-dir>/simulation-<env>.log`.
    #[clap(long)]
    log_dir: Option<PathBuf>,
    #[clap(long)]
    debug: bool,
}

fn init_logging(log_dir: Option<&Path>, environment: &str, debug: bool) -> anyhow::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let path = dir.join(format!("simulation-{}.log", environment));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = LedgerNodeConfig::load(&args.config_path)?;
    config.validate()?;
    init_logging(args.log_dir.as_deref(), &config.environment, args.debug)?;

    let options = if args.dry_run {
        SimulatorOptions {
            update_cache: args.update_network_cache,
            ..SimulatorOptions::dry_run()
        }
    } else {
        SimulatorOptions {
            fix: true,
            update_cache: args.update_network_cache,
            policy: config.fault_policy,
        }
    };
    info!(
        "Simulating {} with fix={} policy={:?}",
        config.environment, options.fix, options.policy
    );

    let metrics = Arc::new(LedgerMetrics::new(&prometheus::Registry::new()));
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
    let simulator = Simulator::new(
        &config,
        store.clone(),
        client,
        &args.cache_dir,
        options,
        metrics,
    );

    match simulator.run().await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if options.fix {
                store.save().await?;
                info!("Store saved to {}", config.store_path.display());
            }
            Ok(())
        }
        Err(e) if e.is_ledger_fault() => {
            error!("Simulation halted on ledger fault: {}", e);
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();
            std::process::exit(1);
        }
        Err(e) => Err(e).context("simulation failed"),
    }
}
