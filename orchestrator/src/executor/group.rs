// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subtasks and the groups they are executed in

use super::task::SubTaskGroupType;
use super::task::TaskId;
use crate::external::Services;
use async_trait::async_trait;
use fleet_common::Error;
use slog::Logger;
use std::sync::Arc;

/// State available to a running subtask
#[derive(Clone)]
pub struct SubTaskContext {
    pub log: Logger,
    pub task_id: TaskId,
    pub services: Services,
}

/// One step of a task
///
/// Subtasks may be retried by resubmitting their task, so implementations
/// must inspect existing state and skip work that is already done.
#[async_trait]
pub trait SubTask: Send + Sync {
    /// Short human-readable description, recorded in the task's history
    fn name(&self) -> String;

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error>;
}

/// A set of subtasks that run concurrently
///
/// All members of a group finish before the next group of the same task
/// starts.
pub struct SubTaskGroup {
    name: String,
    group_type: SubTaskGroupType,
    subtasks: Vec<Arc<dyn SubTask>>,
}

impl SubTaskGroup {
    pub fn new(name: impl Into<String>, group_type: SubTaskGroupType) -> Self {
        SubTaskGroup { name: name.into(), group_type, subtasks: Vec::new() }
    }

    /// Convenience for a group containing exactly one subtask
    pub fn single<S: SubTask + 'static>(
        name: impl Into<String>,
        group_type: SubTaskGroupType,
        subtask: S,
    ) -> Self {
        let mut group = SubTaskGroup::new(name, group_type);
        group.add(subtask);
        group
    }

    pub fn add<S: SubTask + 'static>(&mut self, subtask: S) {
        self.subtasks.push(Arc::new(subtask));
    }

    pub fn set_group_type(&mut self, group_type: SubTaskGroupType) {
        self.group_type = group_type;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_type(&self) -> SubTaskGroupType {
        self.group_type
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub(super) fn subtask_names(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.name()).collect()
    }

    pub(super) fn into_subtasks(self) -> Vec<Arc<dyn SubTask>> {
        self.subtasks
    }
}
