// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task state used while building and running subtask groups

use super::group::SubTask;
use super::group::SubTaskContext;
use super::group::SubTaskGroup;
use super::store::TaskInfoStore;
use super::task::SubTaskGroupRecord;
use super::task::SubTaskRecord;
use super::task::TaskId;
use super::task::TaskInfo;
use super::task::TaskState;
use crate::external::Services;
use fleet_common::Error;
use futures::FutureExt;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Tracks the live [`TaskInfo`] of one task and writes it through to the
/// [`TaskInfoStore`]
pub(super) struct TaskRecorder {
    log: Logger,
    info: watch::Sender<TaskInfo>,
    store: Arc<dyn TaskInfoStore>,
}

impl TaskRecorder {
    pub(super) fn new(
        log: Logger,
        info: watch::Sender<TaskInfo>,
        store: Arc<dyn TaskInfoStore>,
    ) -> TaskRecorder {
        TaskRecorder { log, info, store }
    }

    /// Applies `f` to the live record without persisting it
    ///
    /// The change is written out with the next [`TaskRecorder::update`].
    pub(super) fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut TaskInfo),
    {
        self.info.send_modify(f);
    }

    /// Applies `f` to the record and persists the result
    ///
    /// Failing to persist is logged but does not fail the task: the live
    /// record stays authoritative while this process runs.
    pub(super) async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut TaskInfo),
    {
        self.info.send_modify(f);
        let snapshot = self.info.borrow().clone();
        if let Err(error) = self.store.upsert(snapshot).await {
            warn!(
                self.log,
                "failed to persist task record";
                "error" => %error,
            );
        }
    }
}

/// Builder and runner for the subtask groups of one task
///
/// Task bodies add groups with [`TaskContext::add_subtask_group`] and then run
/// everything queued so far with [`TaskContext::run_subtasks`].  A body may
/// do this more than once; this is how compensating work is queued after a
/// failure.  Groups are numbered in the order they are added.
pub struct TaskContext {
    log: Logger,
    task_id: TaskId,
    services: Services,
    recorder: Arc<TaskRecorder>,
    max_parallel_subtasks: usize,
    queue: Vec<(u32, SubTaskGroup)>,
    next_position: u32,
}

impl TaskContext {
    pub(super) fn new(
        log: Logger,
        task_id: TaskId,
        services: Services,
        recorder: Arc<TaskRecorder>,
        max_parallel_subtasks: usize,
    ) -> TaskContext {
        TaskContext {
            log,
            task_id,
            services,
            recorder,
            max_parallel_subtasks: max_parallel_subtasks.max(1),
            queue: Vec::new(),
            next_position: 0,
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Returns the number of groups queued but not yet run.
    pub fn queued_groups(&self) -> usize {
        self.queue.len()
    }

    /// Queues `group` to run after every group queued before it
    ///
    /// Empty groups are dropped.  The group is persisted as part of the task
    /// record once the queue starts running.
    pub fn add_subtask_group(&mut self, group: SubTaskGroup) {
        if group.is_empty() {
            return;
        }
        let position = self.next_position;
        self.next_position += 1;
        let record = SubTaskGroupRecord {
            position,
            name: group.name().to_string(),
            group_type: group.group_type(),
            state: TaskState::Created,
            subtasks: group
                .subtask_names()
                .into_iter()
                .map(|name| SubTaskRecord {
                    name,
                    state: TaskState::Created,
                    error: None,
                })
                .collect(),
        };
        debug!(
            self.log,
            "queued subtask group";
            "group" => group.name(),
            "position" => position,
            "subtasks" => group.len(),
        );
        self.recorder.modify(|info| info.groups.push(record));
        self.queue.push((position, group));
    }

    /// Discards every queued group, recording them as aborted
    ///
    /// Task bodies use this when they fail while still building their
    /// groups.
    pub async fn abort_queued(&mut self) {
        let aborted: Vec<u32> = std::mem::take(&mut self.queue)
            .into_iter()
            .map(|(position, _)| position)
            .collect();
        if aborted.is_empty() {
            return;
        }
        info!(
            self.log,
            "aborting queued subtask groups";
            "count" => aborted.len(),
        );
        self.recorder
            .update(|info| {
                for position in aborted {
                    if let Some(group) = info.group_mut(position) {
                        group.abort();
                    }
                }
            })
            .await;
    }

    /// Runs every queued group in order
    ///
    /// Stops at the first group with a failed member and returns that
    /// member's error.  The groups queued after it are recorded as aborted
    /// and discarded.
    pub async fn run_subtasks(&mut self) -> Result<(), Error> {
        let mut queue = std::mem::take(&mut self.queue).into_iter();
        while let Some((position, group)) = queue.next() {
            if let Err(error) = self.run_group(position, group).await {
                self.queue = queue.collect();
                self.abort_queued().await;
                return Err(error);
            }
        }
        Ok(())
    }

    async fn run_group(
        &self,
        position: u32,
        group: SubTaskGroup,
    ) -> Result<(), Error> {
        let log = self.log.new(o!(
            "group" => group.name().to_string(),
            "position" => position,
        ));
        info!(log, "running subtask group"; "subtasks" => group.len());
        self.recorder
            .update(|info| {
                if let Some(group) = info.group_mut(position) {
                    group.state = TaskState::Running;
                }
            })
            .await;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_subtasks));
        let subtasks = group.into_subtasks();
        let count = subtasks.len();
        let mut set = JoinSet::new();
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let recorder = Arc::clone(&self.recorder);
            let ctx = SubTaskContext {
                log: log.new(o!("subtask" => subtask.name())),
                task_id: self.task_id,
                services: self.services.clone(),
            };
            set.spawn(async move {
                // Hold onto the permit until the subtask finishes executing
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (
                        index,
                        Err(Error::internal_error("subtask semaphore closed")),
                    );
                };
                recorder
                    .update(|info| {
                        if let Some(record) = subtask_mut(info, position, index)
                        {
                            record.state = TaskState::Running;
                        }
                    })
                    .await;
                let result = run_catching_panics(subtask.as_ref(), &ctx).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<(), Error>>> = vec![None; count];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Err(error) = &result {
                        warn!(
                            log,
                            "subtask failed";
                            "index" => index,
                            "error" => %error,
                        );
                    }
                    let outcome = result.clone();
                    self.recorder
                        .update(|info| record_outcome(info, position, index, outcome))
                        .await;
                    results[index] = Some(result);
                }
                Err(join_error) => {
                    error!(
                        log,
                        "subtask did not run to completion";
                        "error" => %join_error,
                    );
                }
            }
        }

        // Report the failure of the first member (in the order they were
        // added) rather than whichever one happened to finish first.
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            let error = match result {
                Some(Ok(())) => continue,
                Some(Err(error)) => error,
                None => {
                    let error =
                        Error::internal_error("subtask did not run to completion");
                    let outcome = Err(error.clone());
                    self.recorder
                        .update(|info| {
                            record_outcome(info, position, index, outcome)
                        })
                        .await;
                    error
                }
            };
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        let state = if first_error.is_some() {
            TaskState::Failure
        } else {
            TaskState::Success
        };
        self.recorder
            .update(|info| {
                if let Some(group) = info.group_mut(position) {
                    group.state = state;
                }
            })
            .await;
        info!(log, "finished subtask group"; "state" => %state);
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn subtask_mut(
    info: &mut TaskInfo,
    position: u32,
    index: usize,
) -> Option<&mut SubTaskRecord> {
    info.group_mut(position).and_then(|g| g.subtasks.get_mut(index))
}

fn record_outcome(
    info: &mut TaskInfo,
    position: u32,
    index: usize,
    outcome: Result<(), Error>,
) {
    let message = outcome.as_ref().err().map(|e| e.to_string());
    if let Some(record) = subtask_mut(info, position, index) {
        record.state = match outcome {
            Ok(()) => TaskState::Success,
            Err(_) => TaskState::Failure,
        };
        record.error = message.clone();
    }
    if info.error.is_none() {
        info.error = message;
    }
}

async fn run_catching_panics(
    subtask: &dyn SubTask,
    ctx: &SubTaskContext,
) -> Result<(), Error> {
    match AssertUnwindSafe(subtask.run(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Error::internal_error(&format!(
            "subtask panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Extracts the message from a caught panic payload
pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<unknown panic payload>")
    }
}
