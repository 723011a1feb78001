// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registration of every task type with the executor

mod delete_backup;
mod upgrade_component;

pub use delete_backup::DeleteBackup;
pub use delete_backup::DeleteBackupParams;
pub(crate) use delete_backup::delete_backup;
pub use upgrade_component::UpgradeComponent;
pub use upgrade_component::UpgradeComponentParams;

use crate::config::UpgradeConfig;
use crate::executor::Task;
use crate::executor::TaskExecutor;
use crate::executor::TaskType;
use crate::upgrade;
use fleet_common::Error;

/// Registers a factory for every [`TaskType`] with `executor`
pub fn register_all(executor: &mut TaskExecutor, config: &UpgradeConfig) {
    let c = config.clone();
    executor.register(
        TaskType::SoftwareUpgrade,
        move |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(upgrade::SoftwareUpgrade::new(p, &c)?))
        },
    );
    let c = config.clone();
    executor.register(
        TaskType::GFlagsUpgrade,
        move |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(upgrade::GFlagsUpgrade::new(p, &c)?))
        },
    );
    let c = config.clone();
    executor.register(
        TaskType::CertsRotate,
        move |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(upgrade::CertsRotate::new(p, &c)?))
        },
    );
    let c = config.clone();
    executor.register(
        TaskType::RestartUniverse,
        move |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(upgrade::RestartUniverse::new(p, &c)?))
        },
    );
    let c = config.clone();
    executor.register(
        TaskType::ResizeNode,
        move |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(upgrade::ResizeNode::new(p, &c)?))
        },
    );
    executor.register(
        TaskType::DeleteBackup,
        |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(DeleteBackup::new(p)?))
        },
    );
    executor.register(
        TaskType::UpgradeComponent,
        |p: &serde_json::Value| -> Result<Box<dyn Task>, Error> {
            Ok(Box::new(UpgradeComponent::new(p)?))
        },
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::executor::InMemoryTaskInfoStore;
    use crate::executor::TaskState;
    use crate::sim::SimServices;
    use crate::sim::UniverseBuilder;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use fleet_common::backup::BackupState;
    use std::sync::Arc;
    use strum::IntoEnumIterator;

    #[tokio::test]
    async fn test_every_task_type_is_registered() {
        let logctx = test_setup_log("test_every_task_type_is_registered");
        let sim = SimServices::new(&logctx.log, Vec::new());
        let mut executor = TaskExecutor::new(
            &logctx.log,
            sim.services(),
            Arc::new(InMemoryTaskInfoStore::new()),
            &ExecutorConfig::default(),
        );
        register_all(&mut executor, &UpgradeConfig::default());

        // Every type rejects empty parameters rather than being unknown.
        for task_type in TaskType::iter() {
            let error = executor
                .submit(task_type, serde_json::json!({}))
                .await
                .expect_err("accepted empty parameters");
            assert_matches!(
                &error,
                Error::InvalidRequest { message }
                    if !message.contains("unsupported task type"),
                "{} is not registered",
                task_type
            );
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_submit_rejects_unsupported_strategy() {
        let logctx = test_setup_log("test_submit_rejects_unsupported_strategy");
        let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
        let id = universe.id;
        let sim = SimServices::new(&logctx.log, vec![universe]);
        let mut executor = TaskExecutor::new(
            &logctx.log,
            sim.services(),
            Arc::new(InMemoryTaskInfoStore::new()),
            &ExecutorConfig::default(),
        );
        register_all(&mut executor, &UpgradeConfig::default());

        let params = serde_json::json!({
            "universe_id": id,
            "expected_universe_version": 0,
            "upgrade_option": "non_restart",
            "root_ca": uuid::Uuid::new_v4(),
        });
        let error = executor
            .submit(TaskType::CertsRotate, params)
            .await
            .expect_err("accepted no-restart certificate rotation");
        assert_matches!(error, Error::InvalidRequest { .. });

        let params = serde_json::json!({
            "universe_id": id,
            "expected_universe_version": 0,
            "upgrade_option": "non_rolling",
            "instance_type": "c5.2xlarge",
        });
        let error = executor
            .submit(TaskType::ResizeNode, params)
            .await
            .expect_err("accepted non-rolling resize");
        assert_matches!(error, Error::InvalidRequest { .. });
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_delete_backup() {
        let logctx = test_setup_log("test_delete_backup");
        let sim = SimServices::new(&logctx.log, Vec::new());
        let universe_id = uuid::Uuid::new_v4();
        let ok = sim.backups.add_backup(universe_id, None, BackupState::Completed, 10);
        let bad_storage =
            sim.backups.add_backup(universe_id, None, BackupState::Completed, 10);
        sim.backups.invalidate_storage_config(bad_storage.storage_config_id);

        let mut executor = TaskExecutor::new(
            &logctx.log,
            sim.services(),
            Arc::new(InMemoryTaskInfoStore::new()),
            &ExecutorConfig::default(),
        );
        register_all(&mut executor, &UpgradeConfig::default());

        let id = executor
            .submit(
                TaskType::DeleteBackup,
                serde_json::json!({ "backup_id": ok.id }),
            )
            .await
            .unwrap();
        let info = executor.wait_for_task(id).await.unwrap();
        assert_eq!(info.state, TaskState::Success);
        assert_eq!(sim.backups.backup_state(ok.id), None);

        let id = executor
            .submit(
                TaskType::DeleteBackup,
                serde_json::json!({ "backup_id": bad_storage.id }),
            )
            .await
            .unwrap();
        let info = executor.wait_for_task(id).await.unwrap();
        assert_eq!(info.state, TaskState::Failure);
        assert_eq!(
            sim.backups.backup_state(bad_storage.id),
            Some(BackupState::FailedToDelete)
        );
        logctx.cleanup_successful();
    }
}
