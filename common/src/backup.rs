// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backup records operated on by background garbage collection

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Retained-backup floor used when a schedule does not specify one
pub const MIN_NUM_BACKUPS_TO_RETAIN: usize = 5;

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Backup {
    pub id: Uuid,
    pub universe_id: Uuid,
    /// schedule that produced this backup, if any
    pub schedule_id: Option<Uuid>,
    pub storage_config_id: Uuid,
    pub state: BackupState,
    pub time_created: DateTime<Utc>,
    /// when this backup becomes eligible for garbage collection
    pub expiry: Option<DateTime<Utc>>,
}

impl Backup {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map_or(false, |expiry| expiry <= now)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
pub enum BackupState {
    InProgress,
    Completed,
    Failed,
    Skipped,
    Stopped,
    QueuedForDeletion,
    DeleteInProgress,
    FailedToDelete,
    Deleted,
}

impl BackupState {
    /// States in which some other operation is still working on the backup
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            BackupState::InProgress | BackupState::DeleteInProgress
        )
    }
}

/// A recurring backup schedule
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Schedule {
    pub id: Uuid,
    /// Completed backups of this schedule that garbage collection never
    /// drops below.  `None` means [`MIN_NUM_BACKUPS_TO_RETAIN`].
    pub min_num_backups_to_retain: Option<usize>,
}

impl Schedule {
    pub fn min_num_backups_to_retain(&self) -> usize {
        self.min_num_backups_to_retain.unwrap_or(MIN_NUM_BACKUPS_TO_RETAIN)
    }
}

/// A storage destination for backups
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct StorageConfig {
    pub id: Uuid,
    pub name: String,
    pub queued_for_deletion: bool,
}
