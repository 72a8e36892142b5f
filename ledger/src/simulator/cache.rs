// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-disk cache of the network snapshot and the event history, one pair of
//! files per environment. The event file is append-only.

use crate::chain_client::PledgeSource;
use crate::error::{LedgerError, LedgerResult};
use crate::events::event_identity;
use crate::types::{AdminId, Pledge, PledgeAdmin, PledgeId, RawLog};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkState {
    pub pledges: Vec<Pledge>,
    pub admins: Vec<PledgeAdmin>,
    /// Head block the snapshot was taken at.
    pub last_block: Option<u64>,
}

pub struct NetworkCache {
    dir: PathBuf,
    environment: String,
}

impl NetworkCache {
    pub fn new(dir: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            environment: environment.into(),
        }
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", self.environment, suffix))
    }

    pub fn state_path(&self) -> PathBuf {
        self.path("state")
    }

    pub fn events_path(&self) -> PathBuf {
        self.path("events")
    }

    pub fn report_path(&self) -> PathBuf {
        self.path("report")
    }

    pub fn load_state(&self) -> LedgerResult<Option<NetworkState>> {
        read_json(&self.state_path())
    }

    pub fn save_state(&self, state: &NetworkState) -> LedgerResult<()> {
        write_json(&self.state_path(), state)
    }

    pub fn load_events(&self) -> LedgerResult<Vec<RawLog>> {
        Ok(read_json(&self.events_path())?.unwrap_or_default())
    }

    /// Appends `new` to the cached history, skipping removed logs and logs
    /// already present. Returns the merged history in chain order.
    pub fn append_events(&self, new: Vec<RawLog>) -> LedgerResult<Vec<RawLog>> {
        let mut events = self.load_events()?;
        let mut seen: HashSet<_> = events.iter().map(event_identity).collect();
        let before = events.len();
        for log in new.into_iter().filter(|log| !log.removed) {
            if seen.insert(event_identity(&log)) {
                events.push(log);
            }
        }
        events.sort_by_key(|log| (log.block_number, log.log_index));
        info!(
            "[NetworkCache] appended {} events, {} cached for {}",
            events.len() - before,
            events.len(),
            self.environment
        );
        write_json(&self.events_path(), &events)?;
        Ok(events)
    }

    pub fn write_report<T: Serialize>(&self, report: &T) -> LedgerResult<PathBuf> {
        let path = self.report_path();
        write_json(&path, report)?;
        Ok(path)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> LedgerResult<Option<T>> {
    if !path.exists() {
        debug!("[NetworkCache] {} not found", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> LedgerResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Serves pledge and admin reads from a cached [`NetworkState`].
pub struct SnapshotSource {
    pledges: HashMap<PledgeId, Pledge>,
    admins: HashMap<AdminId, PledgeAdmin>,
}

impl SnapshotSource {
    pub fn new(state: &NetworkState) -> Self {
        Self {
            pledges: state.pledges.iter().map(|p| (p.id, p.clone())).collect(),
            admins: state.admins.iter().map(|a| (a.id, a.clone())).collect(),
        }
    }
}

#[async_trait]
impl PledgeSource for SnapshotSource {
    async fn pledge(&self, id: PledgeId) -> LedgerResult<Pledge> {
        self.pledges
            .get(&id)
            .cloned()
            .ok_or(LedgerError::MissingPledge(id))
    }

    async fn pledge_admin(&self, id: AdminId) -> LedgerResult<PledgeAdmin> {
        self.admins
            .get(&id)
            .cloned()
            .ok_or(LedgerError::MissingPledgeAdmin(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{admin, pid, pledge, transfer_log};
    use crate::types::AdminType;
    use ethers::types::{H256, U256};

    #[test]
    fn test_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NetworkCache::new(dir.path(), "develop");
        assert_eq!(cache.load_state().unwrap(), None);

        let state = NetworkState {
            pledges: vec![pledge(1, 1, 10)],
            admins: vec![admin(1, AdminType::Giver)],
            last_block: Some(99),
        };
        cache.save_state(&state).unwrap();
        assert!(cache.state_path().ends_with("develop-state.json"));
        assert_eq!(cache.load_state().unwrap(), Some(state));
    }

    #[test]
    fn test_append_skips_duplicates_and_removed_logs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NetworkCache::new(dir.path(), "develop");
        let first = transfer_log(0, 1, 10, H256::repeat_byte(1), 5, 0);
        let second = transfer_log(1, 2, 10, H256::repeat_byte(2), 3, 0);
        cache.append_events(vec![first.clone()]).unwrap();

        let mut removed = transfer_log(1, 3, 10, H256::repeat_byte(3), 7, 0);
        removed.removed = true;
        let merged = cache
            .append_events(vec![first.clone(), second.clone(), removed])
            .unwrap();
        assert_eq!(merged, vec![second, first]);
        assert_eq!(cache.load_events().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_source_reports_missing_entries() {
        let state = NetworkState {
            pledges: vec![pledge(1, 1, 10)],
            admins: vec![admin(1, AdminType::Giver)],
            last_block: None,
        };
        let source = SnapshotSource::new(&state);
        assert_eq!(source.pledge(pid(1)).await.unwrap().amount, U256::from(10));
        assert_eq!(
            source.pledge(pid(2)).await.unwrap_err(),
            LedgerError::MissingPledge(pid(2))
        );
        assert_eq!(
            source.pledge_admin(4).await.unwrap_err(),
            LedgerError::MissingPledgeAdmin(4)
        );
    }
}
