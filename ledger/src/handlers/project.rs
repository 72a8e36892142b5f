// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::giver::fetch_admin;
use super::{invalid_event, EventContext};
use crate::chain_client::PledgeSource;
use crate::error::{LedgerError, LedgerResult};
use crate::events::LedgerEvent;
use crate::rates::TokenRegistry;
use crate::simulator::aggregates::aggregate_entity;
use crate::store::LedgerStore;
use crate::types::{AdminId, AdminLink, AdminType, AppBinding, Entity, EntityKind, EntityStatus};
use std::sync::Arc;
use tracing::{debug, info};

/// Entity status implied by a milestone review event. Events that do not
/// move the status (reviewer/recipient changes, payment collection) return
/// `None`; payment collection depends on the entity's remaining balance.
pub fn status_for_review_event(event: &LedgerEvent) -> Option<EntityStatus> {
    match event {
        LedgerEvent::RequestReview { .. } => Some(EntityStatus::NeedsReview),
        LedgerEvent::ApproveCompleted { .. } => Some(EntityStatus::Completed),
        LedgerEvent::RejectCompleted { .. } => Some(EntityStatus::InProgress),
        _ => None,
    }
}

/// Campaigns and milestones: admin creation, app bindings and the
/// milestone review cycle.
pub struct ProjectHandler<S, P> {
    store: Arc<S>,
    source: Arc<P>,
    tokens: TokenRegistry,
}

impl<S: LedgerStore, P: PledgeSource> ProjectHandler<S, P> {
    const NAME: &'static str = "ProjectHandler";

    pub fn new(store: Arc<S>, source: Arc<P>, tokens: TokenRegistry) -> Self {
        Self {
            store,
            source,
            tokens,
        }
    }

    pub async fn handle(&self, event: &LedgerEvent, ctx: &EventContext) -> LedgerResult<()> {
        match event {
            LedgerEvent::ProjectAdded { project } => self.project_added(*project, ctx).await,
            LedgerEvent::ProjectUpdated { project } => self.project_updated(*project).await,
            LedgerEvent::SetApp {
                namespace,
                app_id,
                app,
            } => {
                info!("[ProjectHandler] app {:?} bound to {:?}", app_id, app);
                self.store
                    .put_app(AppBinding {
                        namespace: *namespace,
                        app_id: *app_id,
                        address: *app,
                    })
                    .await
            }
            LedgerEvent::RequestReview { project }
            | LedgerEvent::ApproveCompleted { project }
            | LedgerEvent::RejectCompleted { project } => {
                let mut entity = self.linked_entity(*project).await?;
                if let Some(status) = status_for_review_event(event) {
                    info!(
                        "[ProjectHandler] {} {}: {:?} -> {:?}",
                        event.name(),
                        entity.id,
                        entity.status,
                        status
                    );
                    entity.status = status;
                }
                self.store.put_entity(entity).await
            }
            LedgerEvent::ReviewerChanged { project, reviewer } => {
                let mut entity = self.linked_entity(*project).await?;
                entity.reviewer = Some(*reviewer);
                self.store.put_entity(entity).await
            }
            LedgerEvent::RecipientChanged { project, recipient } => {
                let mut entity = self.linked_entity(*project).await?;
                entity.recipient = Some(*recipient);
                self.store.put_entity(entity).await
            }
            LedgerEvent::PaymentCollected { project } => self.payment_collected(*project).await,
            other => Err(invalid_event(Self::NAME, other)),
        }
    }

    async fn project_added(&self, project: AdminId, ctx: &EventContext) -> LedgerResult<()> {
        let admin = fetch_admin(self.source.as_ref(), project, AdminType::Project, Self::NAME).await?;
        self.store.put_admin(admin.clone()).await?;

        let plugin_is_app = match admin.plugin {
            Some(plugin) => self.store.find_app_by_address(&plugin).await?.is_some(),
            None => false,
        };
        let kind = if admin.parent_project.is_some() || plugin_is_app {
            EntityKind::Milestone
        } else {
            EntityKind::Campaign
        };

        let mut entity = self
            .store
            .find_entity_by_tx(kind, &ctx.tx_hash)
            .await?
            .unwrap_or_else(|| Entity::new(format!("{}-{}", kind, project), kind, admin.name.clone()));
        entity.admin_id = Some(project);
        entity.tx_hash.get_or_insert(ctx.tx_hash);
        if entity.status == EntityStatus::Proposed {
            entity.status = match kind {
                EntityKind::Milestone => EntityStatus::InProgress,
                _ => EntityStatus::Active,
            };
        }
        let link = AdminLink {
            admin_id: project,
            kind,
            type_id: entity.id.clone(),
        };
        info!(
            "[ProjectHandler] project {} linked to {} {}",
            project, kind, entity.id
        );
        self.store.put_entity(entity).await?;
        self.store.put_admin_link(link).await
    }

    async fn project_updated(&self, project: AdminId) -> LedgerResult<()> {
        let admin = fetch_admin(self.source.as_ref(), project, AdminType::Project, Self::NAME).await?;
        self.store.put_admin(admin.clone()).await?;
        let Some(link) = self.store.get_admin_link(project).await? else {
            debug!("[ProjectHandler] project {} has no linked entity", project);
            return Ok(());
        };
        if let Some(mut entity) = self.store.get_entity(&link.type_id).await? {
            entity.title = admin.name;
            if admin.canceled {
                entity.status = EntityStatus::Canceled;
            }
            self.store.put_entity(entity).await?;
        }
        Ok(())
    }

    /// Paid once nothing is left to collect, otherwise still in progress.
    async fn payment_collected(&self, project: AdminId) -> LedgerResult<()> {
        let mut entity = self.linked_entity(project).await?;
        let donations = self.store.donations().await?;
        let aggregate = aggregate_entity(&entity, &donations, &self.tokens);
        let drained = aggregate
            .counters
            .values()
            .all(|counter| counter.current_balance.is_zero());
        aggregate.apply_to(&mut entity);
        entity.status = if drained {
            EntityStatus::Paid
        } else {
            EntityStatus::InProgress
        };
        info!(
            "[ProjectHandler] payment collected for {}: status {:?}",
            entity.id, entity.status
        );
        self.store.put_entity(entity).await
    }

    async fn linked_entity(&self, project: AdminId) -> LedgerResult<Entity> {
        let link = self
            .store
            .get_admin_link(project)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("entity for project {}", project)))?;
        self.store
            .get_entity(&link.type_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("entity {}", link.type_id)))
    }
}
