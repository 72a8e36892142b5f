// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Confirmation tracking for raw chain logs.
//!
//! Logs are buffered in the store until enough blocks have been built on top
//! of them, then handed to a [`ConfirmedEventHandler`] in chain order.
//!
//! ```text
//!   observe(log) ──► SequentialEventQueue[identity] ──► create / merge Event
//!                                                        (confirmations=0)
//!
//!   on_new_block(n):
//!       depth = min(n - block, required)
//!       depth <  required ──► persist confirmations
//!       depth == required ──► confirmed=true ──► handler.handle() in (block, log_index) order
//! ```
//!
//! A confirmed event that shows up again at a different position is a reorg
//! deeper than the configured depth. It is logged at error level and flipped
//! back to unconfirmed so it is processed again.

mod config;
mod tracker;

pub use config::ConfirmationConfig;
pub use tracker::{ConfirmationTracker, ConfirmedEventHandler, DispatchSummary, ObserveOutcome};
