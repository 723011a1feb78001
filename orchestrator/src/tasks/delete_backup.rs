// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deletion of one backup from storage and from the catalog

use crate::executor::parse_params;
use crate::executor::SubTask;
use crate::executor::SubTaskContext;
use crate::executor::SubTaskGroup;
use crate::executor::SubTaskGroupType;
use crate::executor::Task;
use crate::executor::TaskContext;
use crate::external::BackupStore;
use async_trait::async_trait;
use fleet_common::backup::BackupState;
use fleet_common::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::warn;
use slog::Logger;
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DeleteBackupParams {
    pub backup_id: Uuid,
}

pub struct DeleteBackup {
    params: DeleteBackupParams,
}

impl DeleteBackup {
    pub fn new(params: &serde_json::Value) -> Result<DeleteBackup, Error> {
        Ok(DeleteBackup { params: parse_params(params)? })
    }
}

#[async_trait]
impl Task for DeleteBackup {
    async fn run(self: Box<Self>, ctx: &mut TaskContext) -> Result<(), Error> {
        ctx.add_subtask_group(SubTaskGroup::single(
            "DeleteBackup",
            SubTaskGroupType::DeletingBackup,
            DeleteBackupData { backup_id: self.params.backup_id },
        ));
        ctx.run_subtasks().await
    }
}

/// Removes the backup's data and then its record
///
/// A backup that is already gone counts as deleted.  On any failure the
/// backup is left in `FailedToDelete` so that garbage collection picks it up
/// again.
struct DeleteBackupData {
    backup_id: Uuid,
}

#[async_trait]
impl SubTask for DeleteBackupData {
    fn name(&self) -> String {
        format!("DeleteBackupData({})", self.backup_id)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        delete_backup(&ctx.log, &*ctx.services.backups, self.backup_id).await
    }
}

/// Deletes one backup's data and record, leaving it in `FailedToDelete` if
/// that fails
///
/// Also used by garbage collection to remove backups of storage configs that
/// are themselves being deleted.
pub(crate) async fn delete_backup(
    log: &Logger,
    store: &dyn BackupStore,
    backup_id: Uuid,
) -> Result<(), Error> {
    let Some(backup) = store.get_backup(backup_id).await? else {
        info!(log, "backup already deleted"; "backup_id" => %backup_id);
        return Ok(());
    };
    if backup.state == BackupState::Deleted {
        // Only the record is left.
        return store.delete_backup_record(backup.id).await;
    }
    if backup.state == BackupState::InProgress {
        return Err(Error::precondition_failed(&format!(
            "backup {} is still being taken",
            backup.id
        )));
    }

    let result = async {
        store.validate_storage_config(&backup).await?;
        store.transition_state(backup.id, BackupState::DeleteInProgress).await?;
        store.delete_backup_data(&backup).await?;
        store.delete_backup_record(backup.id).await
    }
    .await;

    if let Err(error) = &result {
        warn!(
            log,
            "failed to delete backup";
            "backup_id" => %backup.id,
            "error" => %error,
        );
        if let Err(transition_error) =
            store.transition_state(backup.id, BackupState::FailedToDelete).await
        {
            warn!(
                log,
                "failed to record backup deletion failure";
                "backup_id" => %backup.id,
                "error" => %transition_error,
            );
        }
    } else {
        info!(log, "deleted backup"; "backup_id" => %backup.id);
    }
    result
}
