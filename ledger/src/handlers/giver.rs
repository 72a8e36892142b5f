// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{invalid_event, EventContext};
use crate::chain_client::PledgeSource;
use crate::error::{LedgerError, LedgerResult};
use crate::events::LedgerEvent;
use crate::store::LedgerStore;
use crate::types::{AdminId, AdminLink, AdminType, Entity, EntityKind, EntityStatus, PledgeAdmin, User};
use std::sync::Arc;
use tracing::{info, warn};

/// Keeps users linked to their on-chain giver admin.
pub struct GiverHandler<S, P> {
    store: Arc<S>,
    source: Arc<P>,
}

impl<S: LedgerStore, P: PledgeSource> GiverHandler<S, P> {
    const NAME: &'static str = "GiverHandler";

    pub fn new(store: Arc<S>, source: Arc<P>) -> Self {
        Self { store, source }
    }

    pub async fn handle(&self, event: &LedgerEvent, _ctx: &EventContext) -> LedgerResult<()> {
        let giver = match event {
            LedgerEvent::GiverAdded { giver } | LedgerEvent::GiverUpdated { giver } => *giver,
            other => return Err(invalid_event(Self::NAME, other)),
        };
        let admin = fetch_admin(self.source.as_ref(), giver, AdminType::Giver, Self::NAME).await?;
        self.store.put_admin(admin.clone()).await?;

        if let Some(mut previous) = self.store.find_user_by_giver(giver).await? {
            if previous.address != admin.address {
                info!(
                    "[GiverHandler] giver {} moved from {:?} to {:?}",
                    giver, previous.address, admin.address
                );
                previous.giver_id = None;
                self.store.put_user(previous).await?;
            }
        }

        let mut user = self
            .store
            .get_user(&admin.address)
            .await?
            .unwrap_or_else(|| User {
                address: admin.address,
                giver_id: None,
                name: String::new(),
            });
        if let Some(other) = user.giver_id.filter(|other| *other != giver) {
            warn!(
                "[GiverHandler] user {:?} was linked to giver {}, relinking to {}",
                user.address, other, giver
            );
        }
        user.giver_id = Some(giver);
        if user.name.is_empty() {
            user.name = admin.name.clone();
        }
        self.store.put_user(user).await?;
        self.store
            .put_admin_link(AdminLink {
                admin_id: giver,
                kind: EntityKind::Giver,
                type_id: format!("{:?}", admin.address),
            })
            .await
    }
}

/// Mirrors delegate admins as communities.
pub struct DelegateHandler<S, P> {
    store: Arc<S>,
    source: Arc<P>,
}

impl<S: LedgerStore, P: PledgeSource> DelegateHandler<S, P> {
    const NAME: &'static str = "DelegateHandler";

    pub fn new(store: Arc<S>, source: Arc<P>) -> Self {
        Self { store, source }
    }

    pub async fn handle(&self, event: &LedgerEvent, ctx: &EventContext) -> LedgerResult<()> {
        let delegate = match event {
            LedgerEvent::DelegateAdded { delegate } | LedgerEvent::DelegateUpdated { delegate } => {
                *delegate
            }
            other => return Err(invalid_event(Self::NAME, other)),
        };
        let admin =
            fetch_admin(self.source.as_ref(), delegate, AdminType::Delegate, Self::NAME).await?;
        self.store.put_admin(admin.clone()).await?;

        let linked = match self.store.get_admin_link(delegate).await? {
            Some(link) => self.store.get_entity(&link.type_id).await?,
            None => None,
        };
        let mut community = match linked {
            Some(entity) => entity,
            None => self
                .store
                .find_entity_by_tx(EntityKind::Community, &ctx.tx_hash)
                .await?
                .unwrap_or_else(|| {
                    Entity::new(
                        format!("community-{}", delegate),
                        EntityKind::Community,
                        admin.name.clone(),
                    )
                }),
        };
        community.admin_id = Some(delegate);
        community.title = admin.name.clone();
        if community.status == EntityStatus::Proposed {
            community.status = EntityStatus::Active;
        }
        community.tx_hash.get_or_insert(ctx.tx_hash);
        let link = AdminLink {
            admin_id: delegate,
            kind: EntityKind::Community,
            type_id: community.id.clone(),
        };
        info!(
            "[DelegateHandler] delegate {} linked to community {}",
            delegate, community.id
        );
        self.store.put_entity(community).await?;
        self.store.put_admin_link(link).await
    }
}

pub(super) async fn fetch_admin<P: PledgeSource>(
    source: &P,
    id: AdminId,
    expected: AdminType,
    handler: &'static str,
) -> LedgerResult<PledgeAdmin> {
    let admin = source.pledge_admin(id).await?;
    if admin.admin_type != expected {
        return Err(LedgerError::InvalidEvent {
            handler,
            event: format!("admin {} is a {}, expected {}", id, admin.admin_type, expected),
        });
    }
    Ok(admin)
}
