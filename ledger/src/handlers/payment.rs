// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{invalid_event, EventContext};
use crate::chain_client::PledgeSource;
use crate::error::LedgerResult;
use crate::events::{pledge_from_reference, LedgerEvent};
use crate::metrics::LedgerMetrics;
use crate::reconciler::LedgerReconciler;
use crate::store::LedgerStore;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PaymentHandler<S, P> {
    reconciler: Arc<LedgerReconciler<S, P>>,
    metrics: Arc<LedgerMetrics>,
}

impl<S: LedgerStore, P: PledgeSource> PaymentHandler<S, P> {
    const NAME: &'static str = "PaymentHandler";

    pub fn new(reconciler: Arc<LedgerReconciler<S, P>>, metrics: Arc<LedgerMetrics>) -> Self {
        Self {
            reconciler,
            metrics,
        }
    }

    /// A payment without a matching donation is reported, never fatal.
    pub async fn handle(&self, event: &LedgerEvent, ctx: &EventContext) -> LedgerResult<()> {
        let LedgerEvent::AuthorizePayment {
            payment_id,
            reference,
            amount,
            ..
        } = event
        else {
            return Err(invalid_event(Self::NAME, event));
        };
        let Some(pledge) = pledge_from_reference(reference) else {
            warn!(
                "[PaymentHandler] payment {} tx={:?} has no pledge reference",
                payment_id, ctx.tx_hash
            );
            self.metrics.unmatched_payments.inc();
            return Ok(());
        };
        let updated = self.reconciler.attach_payment(pledge, *payment_id).await?;
        if updated == 0 {
            self.metrics.unmatched_payments.inc();
        } else {
            info!(
                "[PaymentHandler] payment {} ({}) attached to {} donations at pledge {}",
                payment_id, amount, updated, pledge
            );
        }
        Ok(())
    }
}
