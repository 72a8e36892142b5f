// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{invalid_event, EventContext};
use crate::chain_client::PledgeSource;
use crate::error::LedgerResult;
use crate::events::LedgerEvent;
use crate::reconciler::{LedgerReconciler, Transfer, TransferOutcome};
use crate::store::LedgerStore;
use std::sync::Arc;
use tracing::debug;

/// Routes pledge transfers and project cancellations to the reconciler.
pub struct PledgeHandler<S, P> {
    reconciler: Arc<LedgerReconciler<S, P>>,
}

impl<S: LedgerStore, P: PledgeSource> PledgeHandler<S, P> {
    const NAME: &'static str = "PledgeHandler";

    pub fn new(reconciler: Arc<LedgerReconciler<S, P>>) -> Self {
        Self { reconciler }
    }

    pub async fn handle(&self, event: &LedgerEvent, ctx: &EventContext) -> LedgerResult<()> {
        match event {
            LedgerEvent::Transfer { from, to, amount } => {
                let transfer = Transfer {
                    from: *from,
                    to: *to,
                    amount: *amount,
                    tx_hash: ctx.tx_hash,
                    block_number: ctx.block_number,
                    log_index: ctx.log_index,
                };
                if let TransferOutcome::Skipped = self.reconciler.apply_transfer(&transfer).await? {
                    debug!(
                        "[PledgeHandler] transfer tx={:?} log_index={} skipped",
                        ctx.tx_hash, ctx.log_index
                    );
                }
                Ok(())
            }
            LedgerEvent::CancelProject { project } => {
                self.reconciler.cancel_project(*project).await?;
                Ok(())
            }
            other => Err(invalid_event(Self::NAME, other)),
        }
    }
}
