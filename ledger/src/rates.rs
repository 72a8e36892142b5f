// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Token whitelist and USD valuation.

use crate::error::{LedgerError, LedgerResult};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

/// Whitelisted tokens keyed by contract address. Any other address is a
/// ledger-consistency fault.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: HashMap<Address, TokenConfig>,
}

impl TokenRegistry {
    pub fn new(tokens: impl IntoIterator<Item = TokenConfig>) -> Self {
        Self {
            tokens: tokens.into_iter().map(|t| (t.address, t)).collect(),
        }
    }

    pub fn resolve(&self, address: &Address) -> LedgerResult<&TokenConfig> {
        self.tokens
            .get(address)
            .ok_or(LedgerError::UnknownToken(*address))
    }

    pub fn get(&self, address: &Address) -> Option<&TokenConfig> {
        self.tokens.get(address)
    }
}

/// Currency rates, consumed as a pure lookup.
pub trait RateProvider: Send + Sync {
    fn usd_rate(&self, symbol: &str, timestamp: Option<u64>) -> Option<f64>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticRates {
    rates: BTreeMap<String, f64>,
}

impl StaticRates {
    pub fn new(rates: BTreeMap<String, f64>) -> Self {
        Self { rates }
    }
}

impl RateProvider for StaticRates {
    fn usd_rate(&self, symbol: &str, _timestamp: Option<u64>) -> Option<f64> {
        self.rates.get(symbol).copied()
    }
}

/// `amount / 10^decimals * rate`, or `None` when no rate is known.
pub fn usd_value(
    rates: &dyn RateProvider,
    token: &TokenConfig,
    amount: U256,
    timestamp: Option<u64>,
) -> Option<f64> {
    let rate = rates.usd_rate(&token.symbol, timestamp)?;
    let units = ethers::utils::format_units(amount, token.decimals as u32).ok()?;
    let units: f64 = units.parse().ok()?;
    Some(units * rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth() -> TokenConfig {
        TokenConfig {
            symbol: "ETH".into(),
            address: Address::zero(),
            decimals: 18,
        }
    }

    #[test]
    fn test_registry_rejects_unknown_tokens() {
        let registry = TokenRegistry::new(vec![eth()]);
        assert_eq!(registry.resolve(&Address::zero()).unwrap().symbol, "ETH");
        assert_eq!(
            registry.resolve(&Address::repeat_byte(1)).unwrap_err(),
            LedgerError::UnknownToken(Address::repeat_byte(1))
        );
    }

    #[test]
    fn test_usd_value() {
        let rates = StaticRates::new(BTreeMap::from([("ETH".to_string(), 2000.0)]));
        let half_eth = U256::exp10(17) * 5;
        let value = usd_value(&rates, &eth(), half_eth, None).unwrap();
        assert!((value - 1000.0).abs() < 1e-9);

        let mut dai = eth();
        dai.symbol = "DAI".into();
        assert_eq!(usd_value(&rates, &dai, half_eth, None), None);
    }
}
