// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration types for confirmation tracking

use serde::{Deserialize, Serialize};

/// Configuration for confirmation tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfirmationConfig {
    /// Number of blocks on top of an event's block before it is dispatched.
    /// `0` dispatches events as soon as they are observed.
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
}

fn default_required_confirmations() -> u64 {
    6
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            required_confirmations: default_required_confirmations(),
        }
    }
}

impl ConfirmationConfig {
    pub fn mainnet() -> Self {
        Self {
            required_confirmations: 12,
        }
    }

    /// Local dev chains never reorg.
    pub fn local() -> Self {
        Self {
            required_confirmations: 0,
        }
    }

    pub fn with_required_confirmations(mut self, required: u64) -> Self {
        self.required_confirmations = required;
        self
    }

    pub fn dispatches_immediately(&self) -> bool {
        self.required_confirmations == 0
    }
}
