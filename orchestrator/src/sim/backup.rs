// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated backup catalog and storage

use crate::external::BackupStore;
use async_trait::async_trait;
use chrono::Duration;
use chrono::Utc;
use fleet_common::backup::Backup;
use fleet_common::backup::BackupState;
use fleet_common::backup::Schedule;
use fleet_common::backup::StorageConfig;
use fleet_common::Error;
use fleet_common::ResourceType;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct BackupStoreState {
    backups: BTreeMap<Uuid, Backup>,
    schedules: BTreeMap<Uuid, Schedule>,
    storage_configs: BTreeMap<Uuid, StorageConfig>,
    /// storage configs whose credentials no longer work
    invalid: BTreeSet<Uuid>,
    /// backups whose data was removed from storage
    data_deleted: BTreeSet<Uuid>,
}

/// Backup catalog kept in memory
///
/// Backups created with [`SimBackupStore::add_backup`] expire one day after
/// they were taken.
#[derive(Default)]
pub struct SimBackupStore {
    state: Mutex<BackupStoreState>,
}

impl SimBackupStore {
    pub fn new() -> SimBackupStore {
        SimBackupStore::default()
    }

    pub fn add_storage_config(&self, name: &str) -> StorageConfig {
        let config = StorageConfig {
            id: Uuid::new_v4(),
            name: name.to_string(),
            queued_for_deletion: false,
        };
        self.state
            .lock()
            .unwrap()
            .storage_configs
            .insert(config.id, config.clone());
        config
    }

    pub fn add_schedule(
        &self,
        min_num_backups_to_retain: Option<usize>,
    ) -> Schedule {
        let schedule = Schedule { id: Uuid::new_v4(), min_num_backups_to_retain };
        self.state
            .lock()
            .unwrap()
            .schedules
            .insert(schedule.id, schedule.clone());
        schedule
    }

    /// Adds a backup taken `age_days` ago to a storage config of its own
    pub fn add_backup(
        &self,
        universe_id: Uuid,
        schedule_id: Option<Uuid>,
        state: BackupState,
        age_days: i64,
    ) -> Backup {
        let config = self.add_storage_config("sim");
        self.add_backup_to(config.id, universe_id, schedule_id, state, age_days)
    }

    /// Adds a backup taken `age_days` ago to an existing storage config
    pub fn add_backup_to(
        &self,
        storage_config_id: Uuid,
        universe_id: Uuid,
        schedule_id: Option<Uuid>,
        state: BackupState,
        age_days: i64,
    ) -> Backup {
        let time_created = Utc::now() - Duration::days(age_days);
        let backup = Backup {
            id: Uuid::new_v4(),
            universe_id,
            schedule_id,
            storage_config_id,
            state,
            time_created,
            expiry: Some(time_created + Duration::days(1)),
        };
        self.state.lock().unwrap().backups.insert(backup.id, backup.clone());
        backup
    }

    pub fn invalidate_storage_config(&self, id: Uuid) {
        self.state.lock().unwrap().invalid.insert(id);
    }

    pub fn queue_storage_config_for_deletion(&self, id: Uuid) {
        if let Some(config) =
            self.state.lock().unwrap().storage_configs.get_mut(&id)
        {
            config.queued_for_deletion = true;
        }
    }

    pub fn storage_config_exists(&self, id: Uuid) -> bool {
        self.state.lock().unwrap().storage_configs.contains_key(&id)
    }

    /// Returns the backup's state, or `None` once its record is gone
    pub fn backup_state(&self, id: Uuid) -> Option<BackupState> {
        self.state.lock().unwrap().backups.get(&id).map(|b| b.state)
    }

    pub fn data_deleted(&self, id: Uuid) -> bool {
        self.state.lock().unwrap().data_deleted.contains(&id)
    }
}

#[async_trait]
impl BackupStore for SimBackupStore {
    async fn list_backups(&self) -> Result<Vec<Backup>, Error> {
        Ok(self.state.lock().unwrap().backups.values().cloned().collect())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>, Error> {
        Ok(self.state.lock().unwrap().backups.get(&id).cloned())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, Error> {
        Ok(self.state.lock().unwrap().schedules.get(&id).cloned())
    }

    async fn validate_storage_config(
        &self,
        backup: &Backup,
    ) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        let id = backup.storage_config_id;
        if !state.storage_configs.contains_key(&id) {
            return Err(Error::not_found_by_id(ResourceType::StorageConfig, &id));
        }
        if state.invalid.contains(&id) {
            return Err(Error::precondition_failed(&format!(
                "credentials of storage config {} are not usable",
                id
            )));
        }
        Ok(())
    }

    async fn transition_state(
        &self,
        id: Uuid,
        state: BackupState,
    ) -> Result<(), Error> {
        let mut inner = self.state.lock().unwrap();
        let backup = inner
            .backups
            .get_mut(&id)
            .ok_or_else(|| Error::not_found_by_id(ResourceType::Backup, &id))?;
        backup.state = state;
        Ok(())
    }

    async fn delete_backup_data(&self, backup: &Backup) -> Result<(), Error> {
        self.state.lock().unwrap().data_deleted.insert(backup.id);
        Ok(())
    }

    async fn delete_backup_record(&self, id: Uuid) -> Result<(), Error> {
        self.state.lock().unwrap().backups.remove(&id);
        Ok(())
    }

    async fn list_storage_configs_queued_for_deletion(
        &self,
    ) -> Result<Vec<StorageConfig>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .storage_configs
            .values()
            .filter(|c| c.queued_for_deletion)
            .cloned()
            .collect())
    }

    async fn delete_storage_config(&self, id: Uuid) -> Result<(), Error> {
        self.state.lock().unwrap().storage_configs.remove(&id);
        Ok(())
    }
}
