// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::confirmation::ConfirmationConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::rates::TokenConfig;
use crate::reconciler::FaultPolicy;
use ethers::types::Address;
use pledge_ledger_config::Config;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    /// Largest block range requested in one `eth_getLogs` call.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_poll_interval", rename = "poll-interval-secs")]
    pub poll_interval: Duration,
    /// Concurrent pledge/admin reads during a snapshot fetch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Consecutive failed operations before the circuit opens.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_concurrency() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    400
}

fn default_max_backoff_secs() -> u64 {
    120
}

fn default_circuit_breaker_threshold() -> u32 {
    3
}

fn default_circuit_cooldown_secs() -> u64 {
    60
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_block_range: default_max_block_range(),
            poll_interval: default_poll_interval(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerNodeConfig {
    /// Environment name, used to key cache files.
    pub environment: String,
    pub rpc_url: String,
    pub liquid_pledging_address: Address,
    #[serde(default)]
    pub vault_address: Option<Address>,
    #[serde(default)]
    pub kernel_address: Option<Address>,
    /// Milestone contracts emitting review events.
    #[serde(default)]
    pub milestone_addresses: Vec<Address>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub tokens: Vec<TokenConfig>,
    /// Static USD rate per token symbol.
    #[serde(default)]
    pub rates: BTreeMap<String, f64>,
    #[serde(default)]
    pub fault_policy: FaultPolicy,
    pub store_path: PathBuf,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_metrics_port() -> u16 {
    9184
}

impl Config for LedgerNodeConfig {}

impl LedgerNodeConfig {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.tokens.is_empty() {
            return Err(LedgerError::Config("token whitelist is empty".into()));
        }
        let mut seen = HashSet::new();
        for token in &self.tokens {
            if !seen.insert(token.address) {
                return Err(LedgerError::Config(format!(
                    "duplicate token address {:?} ({})",
                    token.address, token.symbol
                )));
            }
        }
        if self.fetch.max_attempts == 0 {
            return Err(LedgerError::Config("fetch.max-attempts must be > 0".into()));
        }
        if self.fetch.max_block_range == 0 {
            return Err(LedgerError::Config(
                "fetch.max-block-range must be > 0".into(),
            ));
        }
        url::Url::parse(&self.rpc_url)
            .map_err(|e| LedgerError::Config(format!("invalid rpc-url {}: {}", self.rpc_url, e)))?;
        Ok(())
    }

    /// All contract addresses whose logs are ingested.
    pub fn watched_addresses(&self) -> Vec<Address> {
        let mut addresses = vec![];
        addresses.extend(self.vault_address);
        addresses.extend(self.kernel_address);
        addresses.extend(self.milestone_addresses.iter().copied());
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
environment: develop
rpc-url: http://localhost:8545
liquid-pledging-address: "0x1111111111111111111111111111111111111111"
vault-address: "0x2222222222222222222222222222222222222222"
start-block: 100
confirmation:
  required-confirmations: 2
fetch:
  poll-interval-secs: 3
  max-attempts: 4
tokens:
  - symbol: ETH
    address: "0x0000000000000000000000000000000000000000"
    decimals: 18
rates:
  ETH: 2000.0
fault-policy: isolate
store-path: /tmp/ledger.json
"#;

    #[test]
    fn test_load_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = LedgerNodeConfig::load(&path).unwrap();

        assert_eq!(config.environment, "develop");
        assert_eq!(config.confirmation.required_confirmations, 2);
        assert_eq!(config.fetch.poll_interval, Duration::from_secs(3));
        assert_eq!(config.fetch.max_attempts, 4);
        assert_eq!(config.fetch.max_block_range, 1000);
        assert_eq!(config.fault_policy, FaultPolicy::Isolate);
        assert_eq!(config.metrics_port, 9184);
        assert_eq!(config.watched_addresses().len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_tokens() {
        let mut config: LedgerNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.tokens.push(config.tokens[0].clone());
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config: LedgerNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.fetch.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
