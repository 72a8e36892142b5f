// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistence collaborator for the ledger mirror.
//!
//! The reconciler, handlers and confirmation tracker only use the
//! find/create/patch operations of [`LedgerStore`]. [`MemoryStore`] keeps
//! everything in memory and snapshots to a JSON document on disk.

mod memory;

pub use memory::{MemoryStore, StoreState};

use crate::error::LedgerResult;
use crate::types::{
    AdminId, AdminLink, AppBinding, Donation, DonationId, Entity, EntityKind, EventRecord,
    PledgeAdmin, User,
};
use async_trait::async_trait;
use ethers::types::{Address, H256};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Events
    async fn get_event(&self, identity: &H256) -> LedgerResult<Option<EventRecord>>;
    /// Insert or replace by identity. Fails if a confirmed event with another
    /// identity already holds the same `(transaction_index, block_number,
    /// log_index)`; an unconfirmed holder was reorged out and is evicted.
    async fn put_event(&self, event: EventRecord) -> LedgerResult<()>;
    async fn remove_event(&self, identity: &H256) -> LedgerResult<Option<EventRecord>>;
    /// Events not yet handed to a handler: unconfirmed ones, and confirmed
    /// ones still waiting for dispatch or left mid-dispatch by an
    /// interrupted pass.
    async fn undispatched_events(&self) -> LedgerResult<Vec<EventRecord>>;

    // Donations
    async fn next_donation_id(&self) -> LedgerResult<DonationId>;
    async fn get_donation(&self, id: DonationId) -> LedgerResult<Option<Donation>>;
    async fn put_donation(&self, donation: Donation) -> LedgerResult<()>;
    async fn delete_donation(&self, id: DonationId) -> LedgerResult<()>;
    async fn donations(&self) -> LedgerResult<Vec<Donation>>;

    // Pledge admins and their off-chain links
    async fn get_admin(&self, id: AdminId) -> LedgerResult<Option<PledgeAdmin>>;
    async fn put_admin(&self, admin: PledgeAdmin) -> LedgerResult<()>;
    async fn find_admins_by_parent(&self, parent: AdminId) -> LedgerResult<Vec<PledgeAdmin>>;
    async fn get_admin_link(&self, id: AdminId) -> LedgerResult<Option<AdminLink>>;
    async fn put_admin_link(&self, link: AdminLink) -> LedgerResult<()>;
    async fn remove_admin_link(&self, id: AdminId) -> LedgerResult<()>;

    // Entities
    async fn get_entity(&self, id: &str) -> LedgerResult<Option<Entity>>;
    async fn put_entity(&self, entity: Entity) -> LedgerResult<()>;
    async fn find_entity_by_tx(
        &self,
        kind: EntityKind,
        tx_hash: &H256,
    ) -> LedgerResult<Option<Entity>>;
    async fn entities(&self) -> LedgerResult<Vec<Entity>>;

    // Users
    async fn get_user(&self, address: &Address) -> LedgerResult<Option<User>>;
    async fn put_user(&self, user: User) -> LedgerResult<()>;
    async fn find_user_by_giver(&self, giver: AdminId) -> LedgerResult<Option<User>>;

    // Plugin apps
    async fn put_app(&self, app: AppBinding) -> LedgerResult<()>;
    async fn find_app_by_address(&self, address: &Address) -> LedgerResult<Option<AppBinding>>;

    // Ingestion watermark
    async fn last_processed_block(&self) -> LedgerResult<Option<u64>>;
    async fn set_last_processed_block(&self, block: u64) -> LedgerResult<()>;
}
