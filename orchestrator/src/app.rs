// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembly of the orchestrator from its configuration and collaborators

use crate::background::BackupGarbageCollector;
use crate::background::ComponentUpgradeScheduler;
use crate::background::Driver;
use crate::background::TaskName;
use crate::background::TaskStatus;
use crate::config::OrchestratorConfig;
use crate::executor::TaskExecutor;
use crate::executor::TaskId;
use crate::executor::TaskInfo;
use crate::executor::TaskInfoStore;
use crate::executor::TaskType;
use crate::external::Services;
use crate::tasks;
use anyhow::Context;
use fleet_common::Error;
use slog::info;
use slog::o;
use slog::Logger;
use std::sync::Arc;

/// Builds the root logger described by the configuration
pub fn build_logger(
    config: &OrchestratorConfig,
) -> Result<Logger, anyhow::Error> {
    config
        .log
        .to_logger("fleet-orchestrator")
        .context("initializing logger")
}

/// The task executor together with the background tasks that feed it
///
/// This is the surface exposed to API handlers and command-line tools.
/// Creating one starts the background tasks, so it must happen inside a
/// tokio runtime; dropping it stops them.
pub struct Orchestrator {
    log: Logger,
    executor: Arc<TaskExecutor>,
    driver: Driver,
    backup_gc: TaskName,
    component_upgrade: TaskName,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        config: &OrchestratorConfig,
        services: Services,
        task_store: Arc<dyn TaskInfoStore>,
    ) -> Orchestrator {
        let log = log.new(o!("component" => "Orchestrator"));
        let mut executor = TaskExecutor::new(
            &log,
            services.clone(),
            task_store,
            &config.executor,
        );
        tasks::register_all(&mut executor, &config.upgrade);
        let executor = Arc::new(executor);

        let mut driver = Driver::new();
        let gc_config = &config.background.backup_gc;
        let backup_gc = driver.register(
            &log,
            "backup_gc",
            "deletes expired backups and backups queued for deletion",
            gc_config.period,
            Box::new(BackupGarbageCollector::new(
                Arc::clone(&executor),
                Arc::clone(&services.backups),
                gc_config.clone(),
            )),
        );
        let component_config = &config.background.component_upgrade;
        let component_upgrade = driver.register(
            &log,
            "component_upgrade",
            "upgrades the helper agent of universes running an old version",
            component_config.period,
            Box::new(ComponentUpgradeScheduler::new(
                Arc::clone(&executor),
                Arc::clone(&services.metadata),
                component_config.clone(),
            )),
        );
        info!(log, "orchestrator started");

        Orchestrator { log, executor, driver, backup_gc, component_upgrade }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub async fn submit(
        &self,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> Result<TaskId, Error> {
        self.executor.submit(task_type, params).await
    }

    pub async fn get_task_status(&self, id: TaskId) -> Result<TaskInfo, Error> {
        self.executor.get_task_status(id).await
    }

    pub fn background_tasks(&self) -> &Driver {
        &self.driver
    }

    pub fn backup_gc_task(&self) -> &TaskName {
        &self.backup_gc
    }

    pub fn component_upgrade_task(&self) -> &TaskName {
        &self.component_upgrade
    }

    /// Returns the status of every background task
    pub fn background_status(&self) -> Vec<(TaskName, TaskStatus)> {
        self.driver
            .tasks()
            .map(|name| (name.clone(), self.driver.task_status(name)))
            .collect()
    }
}
