// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of tasks as ordered sequences of subtask groups
//!
//! A *task* is one mutation or maintenance job (an upgrade, a backup
//! deletion, ...).  Callers submit a task by type together with a JSON
//! snapshot of its parameters.  The registered [`TaskFactory`] for the type
//! validates the parameters and produces a [`Task`], whose body runs on its
//! own tokio task.
//!
//! The body builds its work as [`SubTaskGroup`]s through the [`TaskContext`]
//! and runs them.  Groups run strictly one after another; the members of a
//! group run concurrently (up to a configured limit).  The first failing
//! group stops the task: later groups are recorded as aborted and never run.
//!
//! Every change of state is written to a [`TaskInfoStore`], so the history of
//! a task (including which subtask failed and why) survives the task and can
//! be inspected by callers.  Every submitted task reaches a terminal state,
//! even if its body panics.

mod context;
mod group;
mod store;
mod task;

pub use context::TaskContext;
pub use group::SubTask;
pub use group::SubTaskContext;
pub use group::SubTaskGroup;
pub use store::InMemoryTaskInfoStore;
pub use store::TaskInfoStore;
pub use task::SubTaskGroupRecord;
pub use task::SubTaskGroupType;
pub use task::SubTaskRecord;
pub use task::TaskId;
pub use task::TaskInfo;
pub use task::TaskState;
pub use task::TaskType;

use crate::config::ExecutorConfig;
use crate::external::Services;
use async_trait::async_trait;
use chrono::Utc;
use context::panic_message;
use context::TaskRecorder;
use fleet_common::Error;
use fleet_common::ResourceType;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::watch;

/// The body of a task
#[async_trait]
pub trait Task: Send {
    async fn run(self: Box<Self>, ctx: &mut TaskContext) -> Result<(), Error>;
}

/// Produces tasks of one type from their submitted parameters
pub trait TaskFactory: Send + Sync {
    /// Validates `params` and builds the task.  Errors reject the
    /// submission.
    fn create(&self, params: &serde_json::Value) -> Result<Box<dyn Task>, Error>;
}

impl<F> TaskFactory for F
where
    F: Fn(&serde_json::Value) -> Result<Box<dyn Task>, Error> + Send + Sync,
{
    fn create(&self, params: &serde_json::Value) -> Result<Box<dyn Task>, Error> {
        self(params)
    }
}

/// Deserializes submitted task parameters, reporting a mismatch as an
/// invalid request
pub fn parse_params<T: DeserializeOwned>(
    params: &serde_json::Value,
) -> Result<T, Error> {
    serde_json::from_value(params.clone()).map_err(|e| {
        Error::invalid_request(&format!("invalid task parameters: {}", e))
    })
}

/// Runs submitted tasks
pub struct TaskExecutor {
    log: Logger,
    services: Services,
    store: Arc<dyn TaskInfoStore>,
    factories: BTreeMap<TaskType, Box<dyn TaskFactory>>,
    max_parallel_subtasks: usize,
    /// live records of every task submitted to this executor
    tasks: Mutex<BTreeMap<TaskId, watch::Receiver<TaskInfo>>>,
}

impl TaskExecutor {
    pub fn new(
        log: &Logger,
        services: Services,
        store: Arc<dyn TaskInfoStore>,
        config: &ExecutorConfig,
    ) -> TaskExecutor {
        TaskExecutor {
            log: log.new(o!("component" => "TaskExecutor")),
            services,
            store,
            factories: BTreeMap::new(),
            max_parallel_subtasks: config.max_parallel_subtasks,
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register the factory for tasks of type `task_type`
    ///
    /// This function panics if a factory was already registered for the
    /// type.
    pub fn register<F: TaskFactory + 'static>(
        &mut self,
        task_type: TaskType,
        factory: F,
    ) {
        if self.factories.insert(task_type, Box::new(factory)).is_some() {
            panic!("registered two factories for task type {}", task_type);
        }
    }

    /// Submits a task for asynchronous execution
    ///
    /// Returns as soon as the task is recorded.  Parameters the task type
    /// rejects fail the submission with [`Error::InvalidRequest`], and no
    /// record is created for them.
    pub async fn submit(
        &self,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> Result<TaskId, Error> {
        let factory = self.factories.get(&task_type).ok_or_else(|| {
            Error::invalid_request(&format!(
                "unsupported task type: {}",
                task_type
            ))
        })?;
        let task = factory.create(&params)?;

        let id = TaskId::new_v4();
        let info = TaskInfo::new(id, task_type, params);
        self.store.upsert(info.clone()).await?;
        let (info_tx, info_rx) = watch::channel(info);
        self.tasks.lock().unwrap().insert(id, info_rx);

        let log = self.log.new(o!(
            "task_id" => id.to_string(),
            "task_type" => task_type.to_string(),
        ));
        info!(log, "task submitted");
        let recorder = Arc::new(TaskRecorder::new(
            log.clone(),
            info_tx,
            Arc::clone(&self.store),
        ));
        let ctx = TaskContext::new(
            log.clone(),
            id,
            self.services.clone(),
            Arc::clone(&recorder),
            self.max_parallel_subtasks,
        );
        tokio::spawn(run_task(log, task, ctx, recorder));
        Ok(id)
    }

    /// Returns the current record of a task
    pub async fn get_task_status(&self, id: TaskId) -> Result<TaskInfo, Error> {
        let live =
            self.tasks.lock().unwrap().get(&id).map(|rx| rx.borrow().clone());
        if let Some(info) = live {
            return Ok(info);
        }
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found_by_id(ResourceType::Task, &id.0))
    }

    /// Waits for a task to reach a terminal state and returns its record
    pub async fn wait_for_task(&self, id: TaskId) -> Result<TaskInfo, Error> {
        let rx = self.tasks.lock().unwrap().get(&id).cloned();
        let Some(mut rx) = rx else {
            // Not run by this executor: the stored record is all there is.
            let info = self.get_task_status(id).await?;
            if !info.state.is_terminal() {
                return Err(Error::internal_error(&format!(
                    "task {} is not running in this process",
                    id
                )));
            }
            return Ok(info);
        };
        let info = rx
            .wait_for(|info| info.state.is_terminal())
            .await
            .map_err(|_| {
                Error::internal_error(&format!(
                    "task {} stopped without finishing",
                    id
                ))
            })?
            .clone();
        Ok(info)
    }

    /// Returns the records of all known tasks, oldest first
    pub async fn list_tasks(&self) -> Result<Vec<TaskInfo>, Error> {
        self.store.list().await
    }
}

async fn run_task(
    log: Logger,
    task: Box<dyn Task>,
    mut ctx: TaskContext,
    recorder: Arc<TaskRecorder>,
) {
    recorder
        .update(|info| {
            info.state = TaskState::Running;
            info.time_started = Some(Utc::now());
        })
        .await;
    info!(log, "task running");

    let result = match AssertUnwindSafe(task.run(&mut ctx)).catch_unwind().await
    {
        Ok(result) => result,
        Err(payload) => Err(Error::internal_error(&format!(
            "task panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };

    match &result {
        Ok(()) => info!(log, "task succeeded"),
        Err(error) => error!(log, "task failed"; "error" => %error),
    }
    recorder
        .update(|info| {
            for group in &mut info.groups {
                if !group.state.is_terminal() {
                    group.abort();
                }
            }
            match result {
                Ok(()) => info.state = TaskState::Success,
                Err(error) => {
                    info.state = TaskState::Failure;
                    if info.error.is_none() {
                        info.error = Some(error.to_string());
                    }
                }
            }
            info.time_done = Some(Utc::now());
        })
        .await;
}
