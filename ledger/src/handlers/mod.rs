// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Domain handlers for confirmed chain events.
//!
//! ```text
//!   EventRecord ──decode──► LedgerEvent ──► EventDispatcher
//!                                              │
//!        ┌──────────────┬─────────────┬────────┴──────┬────────────────┐
//!        ▼              ▼             ▼               ▼                ▼
//!   GiverHandler  DelegateHandler ProjectHandler PaymentHandler  PledgeHandler
//!   (users)       (communities)   (campaigns,    (payment ids)   (LedgerReconciler)
//!                                  milestones)
//! ```
//!
//! Every handler checks the event against the set it accepts and fails with
//! [`LedgerError::InvalidEvent`] when an event is routed to it by mistake.
//! Unknown signatures fail with [`LedgerError::UnknownEvent`].

mod giver;
mod payment;
mod pledge;
mod project;


pub use giver::{DelegateHandler, GiverHandler};
pub use payment::PaymentHandler;
pub use pledge::PledgeHandler;
pub use project::{status_for_review_event, ProjectHandler};

use crate::chain_client::PledgeSource;
use crate::confirmation::ConfirmedEventHandler;
use crate::error::{LedgerError, LedgerResult};
use crate::events::LedgerEvent;
use crate::metrics::LedgerMetrics;
use crate::rates::TokenRegistry;
use crate::reconciler::LedgerReconciler;
use crate::store::LedgerStore;
use crate::types::{EventRecord, RawLog};
use async_trait::async_trait;
use ethers::types::H256;
use std::sync::Arc;

/// Where an event sits on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub tx_hash: H256,
    pub block_number: u64,
    pub log_index: u64,
}

impl From<&EventRecord> for EventContext {
    fn from(record: &EventRecord) -> Self {
        Self {
            tx_hash: record.transaction_hash,
            block_number: record.block_number,
            log_index: record.log_index,
        }
    }
}

impl From<&RawLog> for EventContext {
    fn from(log: &RawLog) -> Self {
        Self {
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
            log_index: log.log_index,
        }
    }
}

pub(crate) fn invalid_event(handler: &'static str, event: &LedgerEvent) -> LedgerError {
    LedgerError::InvalidEvent {
        handler,
        event: event.name(),
    }
}

pub struct EventDispatcher<S, P> {
    giver: GiverHandler<S, P>,
    delegate: DelegateHandler<S, P>,
    project: ProjectHandler<S, P>,
    payment: PaymentHandler<S, P>,
    pledge: PledgeHandler<S, P>,
}

impl<S: LedgerStore, P: PledgeSource> EventDispatcher<S, P> {
    pub fn new(
        store: Arc<S>,
        source: Arc<P>,
        reconciler: Arc<LedgerReconciler<S, P>>,
        tokens: TokenRegistry,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            giver: GiverHandler::new(store.clone(), source.clone()),
            delegate: DelegateHandler::new(store.clone(), source.clone()),
            project: ProjectHandler::new(store, source, tokens),
            payment: PaymentHandler::new(reconciler.clone(), metrics),
            pledge: PledgeHandler::new(reconciler),
        }
    }

    pub async fn dispatch(&self, event: &LedgerEvent, ctx: &EventContext) -> LedgerResult<()> {
        match event {
            LedgerEvent::Transfer { .. } | LedgerEvent::CancelProject { .. } => {
                self.pledge.handle(event, ctx).await
            }
            LedgerEvent::GiverAdded { .. } | LedgerEvent::GiverUpdated { .. } => {
                self.giver.handle(event, ctx).await
            }
            LedgerEvent::DelegateAdded { .. } | LedgerEvent::DelegateUpdated { .. } => {
                self.delegate.handle(event, ctx).await
            }
            LedgerEvent::ProjectAdded { .. }
            | LedgerEvent::ProjectUpdated { .. }
            | LedgerEvent::SetApp { .. }
            | LedgerEvent::RequestReview { .. }
            | LedgerEvent::ApproveCompleted { .. }
            | LedgerEvent::RejectCompleted { .. }
            | LedgerEvent::ReviewerChanged { .. }
            | LedgerEvent::RecipientChanged { .. }
            | LedgerEvent::PaymentCollected { .. } => self.project.handle(event, ctx).await,
            LedgerEvent::AuthorizePayment { .. } => self.payment.handle(event, ctx).await,
            LedgerEvent::Unknown { signature } => Err(LedgerError::UnknownEvent(*signature)),
        }
    }

    pub async fn dispatch_log(&self, log: &RawLog) -> LedgerResult<()> {
        let event = LedgerEvent::decode(&log.topics, &log.data)?;
        self.dispatch(&event, &EventContext::from(log)).await
    }
}

#[async_trait]
impl<S: LedgerStore, P: PledgeSource> ConfirmedEventHandler for EventDispatcher<S, P> {
    async fn handle(&self, record: &EventRecord) -> LedgerResult<()> {
        let event = LedgerEvent::decode(&record.topics, &record.data)?;
        self.dispatch(&event, &EventContext::from(record)).await
    }
}
