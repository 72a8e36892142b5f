// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::{AdminId, PledgeId};
use ethers::types::{Address, H256, U256};
use thiserror::Error;

/// Coarse grouping of failures, used to decide between retrying, halting
/// and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// RPC timeouts and provider disconnects. Retried with backoff.
    Connectivity,
    /// The replayed ledger cannot be reconciled with chain state.
    LedgerConsistency,
    /// A confirmed event changed underneath us.
    ReorgAnomaly,
    /// A chain event was routed to the wrong handler or could not be decoded.
    InvalidEvent,
    Storage,
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    // Connectivity
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("Circuit breaker open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    // Ledger consistency
    #[error(
        "Insufficient charged balance at pledge {pledge}: needed {needed}, available {available} (tx {tx_hash:?})"
    )]
    InsufficientBalance {
        pledge: PledgeId,
        needed: U256,
        available: U256,
        tx_hash: H256,
    },
    #[error("Token {0:?} is not in the token whitelist")]
    UnknownToken(Address),
    #[error("Pledge {pledge} has unrecognized pledge state {state}")]
    UnrecognizedPledgeState { pledge: PledgeId, state: u8 },
    #[error("Pledge admin {0} does not exist")]
    MissingPledgeAdmin(AdminId),
    #[error("Pledge {0} does not exist")]
    MissingPledge(PledgeId),
    #[error("Pledge {0} is quarantined after an earlier fault")]
    QuarantinedPledge(PledgeId),

    // Reorg
    #[error("Confirmed event {identity:?} changed after confirmation: {detail}")]
    ReorgAnomaly { identity: H256, detail: String },

    // Event routing and decoding
    #[error("Handler {handler} cannot process event {event}")]
    InvalidEvent { handler: &'static str, event: String },
    #[error("Unknown event signature {0:?}")]
    UnknownEvent(H256),
    #[error("Decode error: {0}")]
    Decode(String),

    // Storage
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate event position: {0}")]
    DuplicateEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::Rpc(_) => "rpc",
            LedgerError::Provider(_) => "provider",
            LedgerError::RetriesExhausted { .. } => "retries_exhausted",
            LedgerError::CircuitOpen { .. } => "circuit_open",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::UnknownToken(_) => "unknown_token",
            LedgerError::UnrecognizedPledgeState { .. } => "unrecognized_pledge_state",
            LedgerError::MissingPledgeAdmin(_) => "missing_pledge_admin",
            LedgerError::MissingPledge(_) => "missing_pledge",
            LedgerError::QuarantinedPledge(_) => "quarantined_pledge",
            LedgerError::ReorgAnomaly { .. } => "reorg_anomaly",
            LedgerError::InvalidEvent { .. } => "invalid_event",
            LedgerError::UnknownEvent(_) => "unknown_event",
            LedgerError::Decode(_) => "decode",
            LedgerError::Storage(_) => "storage",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::DuplicateEvent(_) => "duplicate_event",
            LedgerError::Config(_) => "config",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Rpc(_)
            | LedgerError::Provider(_)
            | LedgerError::RetriesExhausted { .. }
            | LedgerError::CircuitOpen { .. } => ErrorCategory::Connectivity,
            LedgerError::InsufficientBalance { .. }
            | LedgerError::UnknownToken(_)
            | LedgerError::UnrecognizedPledgeState { .. }
            | LedgerError::MissingPledgeAdmin(_)
            | LedgerError::MissingPledge(_)
            | LedgerError::QuarantinedPledge(_) => ErrorCategory::LedgerConsistency,
            LedgerError::ReorgAnomaly { .. } => ErrorCategory::ReorgAnomaly,
            LedgerError::InvalidEvent { .. }
            | LedgerError::UnknownEvent(_)
            | LedgerError::Decode(_) => ErrorCategory::InvalidEvent,
            LedgerError::Storage(_) | LedgerError::NotFound(_) | LedgerError::DuplicateEvent(_) => {
                ErrorCategory::Storage
            }
            LedgerError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Only connectivity failures are worth retrying. Circuit-open is not,
    /// the caller has to wait for the cooldown.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Rpc(_) | LedgerError::Provider(_))
    }

    pub fn is_ledger_fault(&self) -> bool {
        self.category() == ErrorCategory::LedgerConsistency
    }
}

impl From<ethers::providers::ProviderError> for LedgerError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        LedgerError::Provider(e.to_string())
    }
}

impl From<ethers::abi::Error> for LedgerError {
    fn from(e: ethers::abi::Error) -> Self {
        LedgerError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
