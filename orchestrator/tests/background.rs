// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background tasks activated against the simulated fleet

use fleet_common::backup::BackupState;
use fleet_common::universe::CloudType;
use fleet_common::universe::Universe;
use fleet_orchestrator::background::BackgroundTask;
use fleet_orchestrator::background::BackupGarbageCollector;
use fleet_orchestrator::background::ComponentUpgradeScheduler;
use fleet_orchestrator::config::BackupGcConfig;
use fleet_orchestrator::config::ComponentUpgradeConfig;
use fleet_orchestrator::config::ExecutorConfig;
use fleet_orchestrator::config::UpgradeConfig;
use fleet_orchestrator::executor::InMemoryTaskInfoStore;
use fleet_orchestrator::executor::TaskExecutor;
use fleet_orchestrator::executor::TaskState;
use fleet_orchestrator::executor::TaskType;
use fleet_orchestrator::sim::SimServices;
use fleet_orchestrator::sim::UniverseBuilder;
use fleet_orchestrator::tasks::register_all;
use fleet_orchestrator::test_util::test_setup_log;
use serde_json::json;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const STABLE_VERSION: &str = "1.1.0";

fn executor(log: &Logger, sim: &SimServices) -> Arc<TaskExecutor> {
    let mut executor = TaskExecutor::new(
        log,
        sim.services(),
        Arc::new(InMemoryTaskInfoStore::new()),
        &ExecutorConfig::default(),
    );
    register_all(&mut executor, &UpgradeConfig::default());
    Arc::new(executor)
}

fn gc_config(max_batch: usize) -> BackupGcConfig {
    BackupGcConfig {
        period: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(10),
        max_poll_tries: 500,
        max_batch,
        default_min_backups_to_retain: 3,
    }
}

fn component_config() -> ComponentUpgradeConfig {
    ComponentUpgradeConfig {
        period: Duration::from_secs(3600),
        stable_version: STABLE_VERSION.to_string(),
        package_location: "https://packages.example.com/agent".to_string(),
        universe_batch_size: 2,
        node_batch_size: 10,
        poll_interval: Duration::from_millis(10),
        max_poll_tries: 500,
        allow_scheduled_upgrade: true,
        probe_timeout: Duration::from_secs(1),
        result_poll_interval: Duration::from_millis(10),
        result_max_polls: 10,
    }
}

fn ids(value: &serde_json::Value) -> BTreeSet<Uuid> {
    serde_json::from_value(value.clone()).unwrap()
}

#[tokio::test]
async fn test_backup_gc_retention_floor() {
    let logctx = test_setup_log("test_backup_gc_retention_floor");
    let sim = SimServices::new(&logctx.log, Vec::new());
    let universe_id = Uuid::new_v4();
    let schedule = sim.backups.add_schedule(Some(5));
    let backups: Vec<_> = (0..7)
        .map(|i| {
            sim.backups.add_backup(
                universe_id,
                Some(schedule.id),
                BackupState::Completed,
                10 + i,
            )
        })
        .collect();

    let mut gc = BackupGarbageCollector::new(
        executor(&logctx.log, &sim),
        sim.backups.clone(),
        gc_config(10),
    );
    let status = BackgroundTask::activate(&mut gc, &logctx.log).await;
    assert_eq!(status["errors"], json!([]));

    // Seven completed backups with a floor of five: the two oldest go.
    let oldest: BTreeSet<_> = backups[5..].iter().map(|b| b.id).collect();
    assert_eq!(ids(&status["epoch"]["completed"]), oldest);
    for backup in &backups[..5] {
        assert_eq!(
            sim.backups.backup_state(backup.id),
            Some(BackupState::Completed)
        );
    }
    for backup in &backups[5..] {
        assert_eq!(sim.backups.backup_state(backup.id), None);
        assert!(sim.backups.data_deleted(backup.id));
    }

    // The floor is reached: nothing more is deleted.
    let status = BackgroundTask::activate(&mut gc, &logctx.log).await;
    assert_eq!(status["epoch"]["submitted"], json!(0));
    assert_eq!(status["epoch"]["completed"], json!([]));
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_backup_gc_default_retention() {
    let logctx = test_setup_log("test_backup_gc_default_retention");
    let sim = SimServices::new(&logctx.log, Vec::new());
    let universe_id = Uuid::new_v4();
    // No minimum on the schedule: the configured default of three applies.
    let schedule = sim.backups.add_schedule(None);
    for i in 0..4 {
        sim.backups.add_backup(
            universe_id,
            Some(schedule.id),
            BackupState::Completed,
            10 + i,
        );
    }

    let mut gc = BackupGarbageCollector::new(
        executor(&logctx.log, &sim),
        sim.backups.clone(),
        gc_config(10),
    );
    let status = BackgroundTask::activate(&mut gc, &logctx.log).await;
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 1);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_backup_gc_special_cases() {
    let logctx = test_setup_log("test_backup_gc_special_cases");
    let sim = SimServices::new(&logctx.log, Vec::new());
    let universe_id = Uuid::new_v4();

    let not_expired =
        sim.backups.add_backup(universe_id, None, BackupState::Completed, 0);
    let in_progress =
        sim.backups.add_backup(universe_id, None, BackupState::InProgress, 10);
    let queued = sim.backups.add_backup(
        universe_id,
        None,
        BackupState::QueuedForDeletion,
        0,
    );
    let bad_storage =
        sim.backups.add_backup(universe_id, None, BackupState::Completed, 10);
    sim.backups.invalidate_storage_config(bad_storage.storage_config_id);

    // Backups of a storage config queued for deletion are removed along
    // with the config itself.
    let doomed = sim.backups.add_storage_config("doomed");
    let doomed_backups: Vec<_> = (0..2)
        .map(|_| {
            sim.backups.add_backup_to(
                doomed.id,
                universe_id,
                None,
                BackupState::QueuedForDeletion,
                0,
            )
        })
        .collect();
    sim.backups.queue_storage_config_for_deletion(doomed.id);

    let executor = executor(&logctx.log, &sim);
    let mut gc = BackupGarbageCollector::new(
        Arc::clone(&executor),
        sim.backups.clone(),
        gc_config(10),
    );
    let status = BackgroundTask::activate(&mut gc, &logctx.log).await;
    assert_eq!(status["errors"], json!([]));

    assert!(!sim.backups.storage_config_exists(doomed.id));
    assert_eq!(status["storage_configs_deleted"], json!([doomed.id]));
    for backup in &doomed_backups {
        assert_eq!(sim.backups.backup_state(backup.id), None);
        assert!(sim.backups.data_deleted(backup.id));
    }

    assert_eq!(status["invalid_storage_config"], json!([bad_storage.id]));
    assert_eq!(
        sim.backups.backup_state(bad_storage.id),
        Some(BackupState::FailedToDelete)
    );
    assert!(!sim.backups.data_deleted(bad_storage.id));

    assert_eq!(status["skipped"], json!([in_progress.id]));
    assert_eq!(
        sim.backups.backup_state(in_progress.id),
        Some(BackupState::InProgress)
    );
    assert_eq!(
        sim.backups.backup_state(not_expired.id),
        Some(BackupState::Completed)
    );

    // The queued backup of a live storage config goes through a task.
    assert_eq!(status["epoch"]["completed"], json!([queued.id]));
    assert_eq!(sim.backups.backup_state(queued.id), None);
    let tasks = executor.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::DeleteBackup);
    assert_eq!(tasks[0].state, TaskState::Success);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_backup_gc_batches() {
    let logctx = test_setup_log("test_backup_gc_batches");
    let sim = SimServices::new(&logctx.log, Vec::new());
    let universe_id = Uuid::new_v4();
    let backups: Vec<_> = (0..3)
        .map(|_| {
            sim.backups.add_backup(universe_id, None, BackupState::Completed, 10)
        })
        .collect();

    let mut gc = BackupGarbageCollector::new(
        executor(&logctx.log, &sim),
        sim.backups.clone(),
        gc_config(2),
    );
    let status = BackgroundTask::activate(&mut gc, &logctx.log).await;
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 2);
    assert_eq!(status["deferred"], json!(1));

    let status = BackgroundTask::activate(&mut gc, &logctx.log).await;
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 1);
    assert_eq!(status["deferred"], json!(0));
    for backup in &backups {
        assert_eq!(sim.backups.backup_state(backup.id), None);
    }
    logctx.cleanup_successful();
}

fn component_universe(name: &str, version: Option<&str>) -> Universe {
    UniverseBuilder::new(name).masters_and_tservers(3).component(version).build()
}

#[tokio::test]
async fn test_component_upgrade_batches() {
    let logctx = test_setup_log("test_component_upgrade_batches");
    let outdated: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| component_universe(name, Some("1.0.0")))
        .collect();
    let current = component_universe("d", Some(STABLE_VERSION));
    let disabled = UniverseBuilder::new("e").masters_and_tservers(3).build();
    let kubernetes = UniverseBuilder::new("f")
        .masters_and_tservers(3)
        .provider(CloudType::Kubernetes)
        .component(Some("1.0.0"))
        .build();
    let mut universes = outdated.clone();
    universes.extend([current.clone(), disabled.clone(), kubernetes.clone()]);
    let sim = SimServices::new(&logctx.log, universes);

    let mut scheduler = ComponentUpgradeScheduler::new(
        executor(&logctx.log, &sim),
        sim.metadata.clone(),
        component_config(),
    );

    // At most two universes per epoch.
    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["enabled"], json!(true));
    assert_eq!(status["eligible"], json!(3));
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 2);

    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["eligible"], json!(1));
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 1);

    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["eligible"], json!(0));
    assert_eq!(status["epoch"]["submitted"], json!(0));

    for universe in &outdated {
        let stored = sim.metadata.get(universe.id).unwrap();
        assert_eq!(stored.component_version.as_deref(), Some(STABLE_VERSION));
        assert_eq!(stored.version, 1);
        assert!(!stored.update_in_progress);
        for node in &stored.nodes {
            assert_eq!(
                sim.components.installed_version(&node.node_name).as_deref(),
                Some(STABLE_VERSION)
            );
        }
    }
    for universe in [&current, &disabled, &kubernetes] {
        let stored = sim.metadata.get(universe.id).unwrap();
        assert_eq!(stored.version, 0);
        assert_eq!(stored.component_version, universe.component_version);
    }
    assert_eq!(sim.components.installed_version("f-n1"), None);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_component_upgrade_node_weight() {
    let logctx = test_setup_log("test_component_upgrade_node_weight");
    let small = component_universe("a", Some("1.0.0"));
    let large = UniverseBuilder::new("b")
        .masters_and_tservers(3)
        .tservers_only(6)
        .component(Some("1.0.0"))
        .build();
    let sim = SimServices::new(&logctx.log, vec![small, large]);

    let config = ComponentUpgradeConfig {
        node_batch_size: 5,
        ..component_config()
    };
    let mut scheduler = ComponentUpgradeScheduler::new(
        executor(&logctx.log, &sim),
        sim.metadata.clone(),
        config,
    );

    // Whichever universe comes first is taken even when it alone exceeds
    // the node budget; the other one has to wait.
    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["eligible"], json!(2));
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 1);
    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["eligible"], json!(1));
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 1);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_component_upgrade_unreachable_and_staged() {
    let logctx = test_setup_log("test_component_upgrade_unreachable_and_staged");
    let unreachable = component_universe("a", Some("1.0.0"));
    let staged = component_universe("b", Some("1.0.0"));
    let sim = SimServices::new(
        &logctx.log,
        vec![unreachable.clone(), staged.clone()],
    );
    sim.components.set_unreachable("a-n2");
    sim.components.fail_shared_package("b-n3");

    let mut scheduler = ComponentUpgradeScheduler::new(
        executor(&logctx.log, &sim),
        sim.metadata.clone(),
        component_config(),
    );
    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["epoch"]["completed"].as_array().unwrap().len(), 2);

    // The skipped node keeps the universe's recorded version from moving.
    let stored = sim.metadata.get(unreachable.id).unwrap();
    assert_eq!(stored.component_version.as_deref(), Some("1.0.0"));
    assert!(!stored.update_in_progress);
    assert_eq!(
        sim.components.installed_version("a-n1").as_deref(),
        Some(STABLE_VERSION)
    );
    assert_eq!(sim.components.installed_version("a-n2"), None);

    // The failed shared-package upgrade was retried from a staged package.
    assert_eq!(sim.components.staged(), vec!["b-n3"]);
    let stored = sim.metadata.get(staged.id).unwrap();
    assert_eq!(stored.component_version.as_deref(), Some(STABLE_VERSION));

    // The universe with the unreachable node is tried again.
    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["eligible"], json!(1));
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_component_upgrade_disabled() {
    let logctx = test_setup_log("test_component_upgrade_disabled");
    let universe = component_universe("a", Some("1.0.0"));
    let id = universe.id;
    let sim = SimServices::new(&logctx.log, vec![universe]);
    let executor = executor(&logctx.log, &sim);
    let config = ComponentUpgradeConfig {
        allow_scheduled_upgrade: false,
        ..component_config()
    };
    let mut scheduler = ComponentUpgradeScheduler::new(
        Arc::clone(&executor),
        sim.metadata.clone(),
        config,
    );

    let status = BackgroundTask::activate(&mut scheduler, &logctx.log).await;
    assert_eq!(status["enabled"], json!(false));
    assert!(executor.list_tasks().await.unwrap().is_empty());
    assert_eq!(sim.metadata.get(id).unwrap().version, 0);
    logctx.cleanup_successful();
}
