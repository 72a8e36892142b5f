// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::LedgerStore;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{
    AdminId, AdminLink, AppBinding, Donation, DonationId, Entity, EntityKind, EventRecord,
    EventStatus, PledgeAdmin, User,
};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Everything the store holds, serialized as one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreState {
    pub events: BTreeMap<H256, EventRecord>,
    pub donations: BTreeMap<DonationId, Donation>,
    pub next_donation_id: u64,
    pub admins: BTreeMap<AdminId, PledgeAdmin>,
    pub admin_links: BTreeMap<AdminId, AdminLink>,
    pub entities: BTreeMap<String, Entity>,
    pub users: BTreeMap<Address, User>,
    pub apps: Vec<AppBinding>,
    pub last_processed_block: Option<u64>,
    /// `(transaction_index, block_number, log_index)` to event identity.
    #[serde(skip)]
    pub(crate) event_keys: HashMap<(u64, u64, u64), H256>,
}

pub struct MemoryStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
    #[cfg(test)]
    failing_donation_writes: std::sync::atomic::AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_state(StoreState::default())
    }

    pub fn from_state(mut state: StoreState) -> Self {
        let max_id = state.donations.keys().next_back().map(|id| id.0).unwrap_or(0);
        state.next_donation_id = state.next_donation_id.max(max_id + 1);
        state.event_keys = state
            .events
            .values()
            .map(|e| (e.unique_key(), e.identity))
            .collect();
        Self {
            state: RwLock::new(state),
            path: None,
            #[cfg(test)]
            failing_donation_writes: Default::default(),
        }
    }

    /// Makes the next `count` donation writes fail with a storage error.
    #[cfg(test)]
    pub(crate) fn fail_next_donation_writes(&self, count: u32) {
        self.failing_donation_writes
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Opens the JSON document at `path`, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            info!("[MemoryStore] {} not found, starting empty", path.display());
            StoreState::default()
        };
        let mut store = Self::from_state(state);
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Writes the document back to the path it was opened from.
    pub async fn save(&self) -> LedgerResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&*self.state.read().await)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        debug!("[MemoryStore] saved to {}", path.display());
        Ok(())
    }

    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_event(&self, identity: &H256) -> LedgerResult<Option<EventRecord>> {
        Ok(self.state.read().await.events.get(identity).cloned())
    }

    async fn put_event(&self, event: EventRecord) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let key = event.unique_key();
        let identity = event.identity;
        if let Some(holder) = state.event_keys.get(&key).copied() {
            if holder != identity {
                match state.events.get(&holder) {
                    Some(other) if other.confirmed => {
                        return Err(LedgerError::DuplicateEvent(format!(
                            "{:?} already holds (tx_index={}, block={}, log_index={})",
                            holder, key.0, key.1, key.2
                        )));
                    }
                    Some(other) => {
                        warn!(
                            "[MemoryStore] unconfirmed {} tx={:?} at (tx_index={}, block={}, log_index={}) replaced by {:?}",
                            other.event, other.transaction_hash, key.0, key.1, key.2, identity
                        );
                        state.events.remove(&holder);
                    }
                    None => {}
                }
            }
        }
        if let Some(previous) = state.events.insert(identity, event) {
            let previous_key = previous.unique_key();
            if previous_key != key && state.event_keys.get(&previous_key) == Some(&identity) {
                state.event_keys.remove(&previous_key);
            }
        }
        state.event_keys.insert(key, identity);
        Ok(())
    }

    async fn remove_event(&self, identity: &H256) -> LedgerResult<Option<EventRecord>> {
        let mut state = self.state.write().await;
        let removed = state.events.remove(identity);
        if let Some(event) = &removed {
            let key = event.unique_key();
            if state.event_keys.get(&key) == Some(identity) {
                state.event_keys.remove(&key);
            }
        }
        Ok(removed)
    }

    async fn undispatched_events(&self) -> LedgerResult<Vec<EventRecord>> {
        Ok(self
            .state
            .read()
            .await
            .events
            .values()
            .filter(|e| {
                !e.confirmed
                    || matches!(e.status, EventStatus::Waiting | EventStatus::Processing)
            })
            .cloned()
            .collect())
    }

    async fn next_donation_id(&self) -> LedgerResult<DonationId> {
        let mut state = self.state.write().await;
        let id = state.next_donation_id.max(1);
        state.next_donation_id = id + 1;
        Ok(DonationId(id))
    }

    async fn get_donation(&self, id: DonationId) -> LedgerResult<Option<Donation>> {
        Ok(self.state.read().await.donations.get(&id).cloned())
    }

    async fn put_donation(&self, donation: Donation) -> LedgerResult<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .failing_donation_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LedgerError::Storage(format!(
                    "injected write failure for donation {}",
                    donation.id
                )));
            }
        }
        let mut state = self.state.write().await;
        if donation.id.0 >= state.next_donation_id {
            state.next_donation_id = donation.id.0 + 1;
        }
        state.donations.insert(donation.id, donation);
        Ok(())
    }

    async fn delete_donation(&self, id: DonationId) -> LedgerResult<()> {
        self.state
            .write()
            .await
            .donations
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| LedgerError::NotFound(format!("donation {}", id)))
    }

    async fn donations(&self) -> LedgerResult<Vec<Donation>> {
        Ok(self.state.read().await.donations.values().cloned().collect())
    }

    async fn get_admin(&self, id: AdminId) -> LedgerResult<Option<PledgeAdmin>> {
        Ok(self.state.read().await.admins.get(&id).cloned())
    }

    async fn put_admin(&self, admin: PledgeAdmin) -> LedgerResult<()> {
        self.state.write().await.admins.insert(admin.id, admin);
        Ok(())
    }

    async fn find_admins_by_parent(&self, parent: AdminId) -> LedgerResult<Vec<PledgeAdmin>> {
        Ok(self
            .state
            .read()
            .await
            .admins
            .values()
            .filter(|a| a.parent_project == Some(parent))
            .cloned()
            .collect())
    }

    async fn get_admin_link(&self, id: AdminId) -> LedgerResult<Option<AdminLink>> {
        Ok(self.state.read().await.admin_links.get(&id).cloned())
    }

    async fn put_admin_link(&self, link: AdminLink) -> LedgerResult<()> {
        self.state
            .write()
            .await
            .admin_links
            .insert(link.admin_id, link);
        Ok(())
    }

    async fn remove_admin_link(&self, id: AdminId) -> LedgerResult<()> {
        self.state.write().await.admin_links.remove(&id);
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> LedgerResult<Option<Entity>> {
        Ok(self.state.read().await.entities.get(id).cloned())
    }

    async fn put_entity(&self, entity: Entity) -> LedgerResult<()> {
        self.state
            .write()
            .await
            .entities
            .insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn find_entity_by_tx(
        &self,
        kind: EntityKind,
        tx_hash: &H256,
    ) -> LedgerResult<Option<Entity>> {
        Ok(self
            .state
            .read()
            .await
            .entities
            .values()
            .find(|e| e.kind == kind && e.tx_hash.as_ref() == Some(tx_hash))
            .cloned())
    }

    async fn entities(&self) -> LedgerResult<Vec<Entity>> {
        Ok(self.state.read().await.entities.values().cloned().collect())
    }

    async fn get_user(&self, address: &Address) -> LedgerResult<Option<User>> {
        Ok(self.state.read().await.users.get(address).cloned())
    }

    async fn put_user(&self, user: User) -> LedgerResult<()> {
        self.state.write().await.users.insert(user.address, user);
        Ok(())
    }

    async fn find_user_by_giver(&self, giver: AdminId) -> LedgerResult<Option<User>> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|u| u.giver_id == Some(giver))
            .cloned())
    }

    async fn put_app(&self, app: AppBinding) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        state
            .apps
            .retain(|a| !(a.namespace == app.namespace && a.app_id == app.app_id));
        state.apps.push(app);
        Ok(())
    }

    async fn find_app_by_address(&self, address: &Address) -> LedgerResult<Option<AppBinding>> {
        Ok(self
            .state
            .read()
            .await
            .apps
            .iter()
            .find(|a| a.address == *address)
            .cloned())
    }

    async fn last_processed_block(&self) -> LedgerResult<Option<u64>> {
        Ok(self.state.read().await.last_processed_block)
    }

    async fn set_last_processed_block(&self, block: u64) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        state.last_processed_block = Some(state.last_processed_block.unwrap_or(0).max(block));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{donation, event_record};
    use crate::types::DonationStatus;

    fn confirmed(mut event: EventRecord, status: EventStatus) -> EventRecord {
        event.confirmed = true;
        event.status = status;
        event
    }

    #[tokio::test]
    async fn test_confirmed_event_position_is_unique() {
        let store = MemoryStore::new();
        let first = confirmed(event_record(H256::repeat_byte(1), 10, 0), EventStatus::Processed);
        store.put_event(first.clone()).await.unwrap();
        // Same identity may be rewritten in place.
        store.put_event(first.clone()).await.unwrap();

        let clash = event_record(H256::repeat_byte(2), 10, 0);
        assert!(matches!(
            store.put_event(clash).await,
            Err(LedgerError::DuplicateEvent(_))
        ));
        assert!(store.get_event(&first.identity).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replacement_evicts_stale_unconfirmed_event() {
        let store = MemoryStore::new();
        let stale = event_record(H256::repeat_byte(1), 10, 0);
        store.put_event(stale.clone()).await.unwrap();

        let canonical = event_record(H256::repeat_byte(2), 10, 0);
        store.put_event(canonical.clone()).await.unwrap();
        assert!(store.get_event(&stale.identity).await.unwrap().is_none());
        let pending = store.undispatched_events().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identity, canonical.identity);
    }

    #[tokio::test]
    async fn test_moved_and_removed_events_free_their_position() {
        let store = MemoryStore::new();
        let mut event = event_record(H256::repeat_byte(1), 10, 0);
        store.put_event(event.clone()).await.unwrap();
        event.block_number = 11;
        store.put_event(event.clone()).await.unwrap();

        let newcomer = confirmed(event_record(H256::repeat_byte(2), 10, 0), EventStatus::Waiting);
        store.put_event(newcomer.clone()).await.unwrap();
        assert!(store.get_event(&event.identity).await.unwrap().is_some());

        store.remove_event(&newcomer.identity).await.unwrap();
        store
            .put_event(event_record(H256::repeat_byte(3), 10, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_dispatch_is_picked_up_again() {
        let store = MemoryStore::new();
        let interrupted = confirmed(event_record(H256::repeat_byte(1), 10, 0), EventStatus::Processing);
        let done = confirmed(event_record(H256::repeat_byte(2), 11, 0), EventStatus::Processed);
        let failed = confirmed(event_record(H256::repeat_byte(3), 12, 0), EventStatus::Failed);
        for event in [interrupted.clone(), done, failed] {
            store.put_event(event).await.unwrap();
        }

        let pending = store.undispatched_events().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identity, interrupted.identity);
    }

    #[tokio::test]
    async fn test_donation_ids_continue_after_existing() {
        let store = MemoryStore::new();
        store
            .put_donation(donation(7, Some(1), 10, 10, DonationStatus::Committed))
            .await
            .unwrap();
        assert_eq!(store.next_donation_id().await.unwrap(), DonationId(8));
        assert_eq!(store.next_donation_id().await.unwrap(), DonationId(9));
        assert!(store.delete_donation(DonationId(99)).await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = MemoryStore::open(&path).unwrap();
        store
            .put_donation(donation(3, Some(2), 50, 20, DonationStatus::Waiting))
            .await
            .unwrap();
        store
            .put_event(event_record(H256::repeat_byte(4), 12, 1))
            .await
            .unwrap();
        store.set_last_processed_block(12).await.unwrap();
        store.set_last_processed_block(11).await.unwrap();
        store.save().await.unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        let saved = reopened.get_donation(DonationId(3)).await.unwrap().unwrap();
        assert_eq!(saved.amount_remaining, ethers::types::U256::from(20));
        assert_eq!(reopened.last_processed_block().await.unwrap(), Some(12));
        assert_eq!(reopened.next_donation_id().await.unwrap(), DonationId(4));
        assert!(reopened
            .get_event(&event_record(H256::repeat_byte(4), 12, 1).identity)
            .await
            .unwrap()
            .is_some());
        // the position index is rebuilt on open
        let clash = event_record(H256::repeat_byte(5), 12, 1);
        reopened.put_event(clash.clone()).await.unwrap();
        assert!(reopened
            .get_event(&event_record(H256::repeat_byte(4), 12, 1).identity)
            .await
            .unwrap()
            .is_none());
    }
}
