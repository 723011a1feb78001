// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that deletes expired and unwanted backups

use super::epoch::select_batch;
use super::epoch::EpochState;
use super::epoch::EpochSummary;
use super::BackgroundTask;
use crate::config::BackupGcConfig;
use crate::executor::parse_params;
use crate::executor::TaskExecutor;
use crate::executor::TaskType;
use crate::external::BackupStore;
use crate::tasks;
use crate::tasks::DeleteBackupParams;
use anyhow::Context;
use chrono::Utc;
use fleet_common::backup::Backup;
use fleet_common::backup::BackupState;
use futures::future::BoxFuture;
use futures::FutureExt;
use itertools::Itertools;
use serde::Serialize;
use serde_json::json;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Picks which of a schedule's expired backups to delete
///
/// Expired backups that are not `Completed` are always deleted.  Expired
/// `Completed` ones are deleted oldest first, but only as many as keep
/// `total_completed` (all `Completed` backups of the schedule, expired or
/// not) at or above `min_retain`.
pub fn select_backups_for_schedule(
    expired: Vec<Backup>,
    total_completed: usize,
    min_retain: usize,
) -> Vec<Backup> {
    let (completed, mut selected): (Vec<_>, Vec<_>) = expired
        .into_iter()
        .partition(|backup| backup.state == BackupState::Completed);
    let count =
        completed.len().min(total_completed.saturating_sub(min_retain));
    selected.extend(
        completed
            .into_iter()
            .sorted_by_key(|backup| backup.time_created)
            .take(count),
    );
    selected
}

#[derive(Debug, Default, Serialize)]
struct GcStatus {
    storage_configs_deleted: Vec<Uuid>,
    /// backups whose storage config could not be used
    invalid_storage_config: Vec<Uuid>,
    /// targets skipped because something else is working on them
    skipped: Vec<Uuid>,
    /// targets left for a later epoch because the batch was full
    deferred: usize,
    errors: Vec<String>,
    epoch: EpochSummary,
}

pub struct BackupGarbageCollector {
    executor: Arc<TaskExecutor>,
    backups: Arc<dyn BackupStore>,
    config: BackupGcConfig,
    /// backups whose deletion failed in the previous epoch
    last_failed: BTreeSet<Uuid>,
}

impl BackupGarbageCollector {
    pub fn new(
        executor: Arc<TaskExecutor>,
        backups: Arc<dyn BackupStore>,
        config: BackupGcConfig,
    ) -> BackupGarbageCollector {
        BackupGarbageCollector {
            executor,
            backups,
            config,
            last_failed: BTreeSet::new(),
        }
    }

    /// Implementation for `BackgroundTask::activate` for
    /// `BackupGarbageCollector`, added here to produce better compile errors.
    ///
    /// The presence of `boxed()` in `BackgroundTask::activate` has caused
    /// some confusion with compilation errors in the past. So separate this
    /// method out.
    async fn activate(&mut self, log: &Logger) -> serde_json::Value {
        let mut status = GcStatus::default();
        let result = self.run_epoch(log, &mut status).await;
        if let Err(error) = result {
            let message = format!("{:#}", error);
            error!(
                log,
                "backup garbage collection failed";
                "error" => &message,
            );
            status.errors.push(message);
        }
        json!(status)
    }

    async fn run_epoch(
        &mut self,
        log: &Logger,
        status: &mut GcStatus,
    ) -> Result<(), anyhow::Error> {
        self.delete_queued_storage_configs(log, status).await?;

        let backups =
            self.backups.list_backups().await.context("listing backups")?;
        let mut targets = BTreeMap::new();
        for backup in &backups {
            if backup.state == BackupState::QueuedForDeletion {
                targets.insert(backup.id, backup.clone());
            }
        }
        for backup in self.expired_targets(&backups).await? {
            if backup.state == BackupState::QueuedForDeletion {
                continue;
            }
            if let Err(error) =
                self.backups.validate_storage_config(&backup).await
            {
                warn!(
                    log,
                    "cannot delete expired backup: storage config is invalid";
                    "backup_id" => %backup.id,
                    "storage_config_id" => %backup.storage_config_id,
                    "error" => %error,
                );
                self.backups
                    .transition_state(backup.id, BackupState::FailedToDelete)
                    .await
                    .with_context(|| {
                        format!("marking backup {} failed", backup.id)
                    })?;
                status.invalid_storage_config.push(backup.id);
                continue;
            }
            targets.insert(backup.id, backup);
        }

        let pending = self.pending_deletions().await?;
        let mut candidates = Vec::new();
        for backup in targets.into_values() {
            if backup.state.is_in_progress() || pending.contains(&backup.id) {
                warn!(
                    log,
                    "not deleting backup: it is in progress";
                    "backup_id" => %backup.id,
                    "state" => %backup.state,
                );
                status.skipped.push(backup.id);
                continue;
            }
            if self.last_failed.contains(&backup.id) {
                status.skipped.push(backup.id);
                continue;
            }
            candidates.push(backup);
        }

        let total = candidates.len();
        let batch = select_batch(candidates, self.config.max_batch, None, |_| 1);
        status.deferred = total - batch.len();

        let mut epoch = EpochState::new();
        for backup in batch {
            let params = json!(DeleteBackupParams { backup_id: backup.id });
            // Failures are recorded in the epoch.
            let _ = epoch
                .submit(
                    log,
                    &self.executor,
                    backup.id,
                    TaskType::DeleteBackup,
                    params,
                )
                .await;
        }
        let store = Arc::clone(&self.backups);
        epoch
            .poll(
                log,
                &self.executor,
                self.config.poll_interval,
                self.config.max_poll_tries,
                |id| {
                    let store = Arc::clone(&store);
                    async move {
                        Ok::<_, fleet_common::Error>(
                            store.get_backup(id).await?.is_some(),
                        )
                    }
                },
            )
            .await;

        status.epoch = epoch.summary();
        info!(
            log,
            "backup garbage collection done";
            "deleted" => status.epoch.completed.len(),
            "failed" => status.epoch.failed.len(),
            "deferred" => status.deferred,
        );
        self.last_failed = epoch.into_failed();
        Ok(())
    }

    /// Deletes the backups of every storage config queued for deletion, then
    /// the config itself
    ///
    /// The config is removed even if some of its backups could not be.
    async fn delete_queued_storage_configs(
        &self,
        log: &Logger,
        status: &mut GcStatus,
    ) -> Result<(), anyhow::Error> {
        let configs = self
            .backups
            .list_storage_configs_queued_for_deletion()
            .await
            .context("listing storage configs queued for deletion")?;
        if configs.is_empty() {
            return Ok(());
        }
        let backups =
            self.backups.list_backups().await.context("listing backups")?;
        for config in configs {
            let log = log.new(slog::o!(
                "storage_config_id" => config.id.to_string(),
                "storage_config" => config.name.clone(),
            ));
            let queued = backups.iter().filter(|b| {
                b.storage_config_id == config.id
                    && b.state == BackupState::QueuedForDeletion
            });
            for backup in queued {
                if let Err(error) =
                    tasks::delete_backup(&log, &*self.backups, backup.id).await
                {
                    status.errors.push(format!(
                        "deleting backup {} of storage config {}: {}",
                        backup.id, config.name, error
                    ));
                }
            }
            match self.backups.delete_storage_config(config.id).await {
                Ok(()) => {
                    info!(log, "deleted storage config");
                    status.storage_configs_deleted.push(config.id);
                }
                Err(error) => {
                    warn!(
                        log,
                        "failed to delete storage config";
                        "error" => %error,
                    );
                    status.errors.push(format!(
                        "deleting storage config {}: {}",
                        config.name, error
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns the expired backups that retention allows deleting
    async fn expired_targets(
        &self,
        backups: &[Backup],
    ) -> Result<Vec<Backup>, anyhow::Error> {
        let now = Utc::now();
        let mut targets = Vec::new();
        let mut by_schedule: BTreeMap<Uuid, Vec<Backup>> = BTreeMap::new();
        for backup in backups.iter().filter(|b| b.is_expired(now)) {
            match backup.schedule_id {
                None => targets.push(backup.clone()),
                Some(schedule_id) => by_schedule
                    .entry(schedule_id)
                    .or_default()
                    .push(backup.clone()),
            }
        }

        for (schedule_id, expired) in by_schedule {
            let total_completed = backups
                .iter()
                .filter(|b| {
                    b.schedule_id == Some(schedule_id)
                        && b.state == BackupState::Completed
                })
                .count();
            let min_retain = self
                .backups
                .get_schedule(schedule_id)
                .await
                .with_context(|| format!("loading schedule {}", schedule_id))?
                .and_then(|schedule| schedule.min_num_backups_to_retain)
                .unwrap_or(self.config.default_min_backups_to_retain);
            targets.extend(select_backups_for_schedule(
                expired,
                total_completed,
                min_retain,
            ));
        }
        Ok(targets)
    }

    /// Returns the backups that an unfinished deletion task is working on
    async fn pending_deletions(&self) -> Result<BTreeSet<Uuid>, anyhow::Error> {
        let tasks =
            self.executor.list_tasks().await.context("listing tasks")?;
        Ok(tasks
            .into_iter()
            .filter(|task| {
                task.task_type == TaskType::DeleteBackup
                    && !task.state.is_terminal()
            })
            .filter_map(|task| {
                parse_params::<DeleteBackupParams>(&task.params)
                    .ok()
                    .map(|params| params.backup_id)
            })
            .collect())
    }
}

impl BackgroundTask for BackupGarbageCollector {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        self.activate(log).boxed()
    }
}
