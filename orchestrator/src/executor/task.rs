// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records describing tasks and their progress

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a submitted task
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new_v4() -> TaskId {
        TaskId(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kinds of task accepted by the executor
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum TaskType {
    SoftwareUpgrade,
    GFlagsUpgrade,
    CertsRotate,
    RestartUniverse,
    ResizeNode,
    DeleteBackup,
    UpgradeComponent,
}

/// Lifecycle state of a task, a subtask group, or a single subtask
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
pub enum TaskState {
    Created,
    Running,
    Success,
    Failure,
    /// never run because an earlier group failed
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Aborted
        )
    }
}

/// Observability tag attached to each subtask group
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
pub enum SubTaskGroupType {
    ConfigureUniverse,
    RunningHooks,
    DownloadingSoftware,
    UpgradingSoftware,
    UpdatingGFlags,
    RotatingCert,
    RestartingNodes,
    ChangeInstanceType,
    DeletingBackup,
    UpgradingComponent,
}

/// Durable record of a task
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    /// snapshot of the parameters the task was submitted with
    pub params: serde_json::Value,
    pub state: TaskState,
    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_done: Option<DateTime<Utc>>,
    /// subtask groups, in `position` order
    pub groups: Vec<SubTaskGroupRecord>,
    /// first failure reported while running the task
    pub error: Option<String>,
}

impl TaskInfo {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> TaskInfo {
        TaskInfo {
            id,
            task_type,
            params,
            state: TaskState::Created,
            time_created: Utc::now(),
            time_started: None,
            time_done: None,
            groups: Vec::new(),
            error: None,
        }
    }

    /// Returns the number of subtasks that finished and the total number of
    /// subtasks recorded so far.
    pub fn progress(&self) -> (usize, usize) {
        let subtasks = self.groups.iter().flat_map(|g| g.subtasks.iter());
        let mut done = 0;
        let mut total = 0;
        for subtask in subtasks {
            total += 1;
            if subtask.state.is_terminal() {
                done += 1;
            }
        }
        (done, total)
    }

    pub(super) fn group_mut(
        &mut self,
        position: u32,
    ) -> Option<&mut SubTaskGroupRecord> {
        self.groups.iter_mut().find(|g| g.position == position)
    }
}

/// Durable record of one subtask group
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct SubTaskGroupRecord {
    /// execution order within the task
    pub position: u32,
    pub name: String,
    pub group_type: SubTaskGroupType,
    pub state: TaskState,
    pub subtasks: Vec<SubTaskRecord>,
}

impl SubTaskGroupRecord {
    pub(super) fn abort(&mut self) {
        self.state = TaskState::Aborted;
        for subtask in &mut self.subtasks {
            if !subtask.state.is_terminal() {
                subtask.state = TaskState::Aborted;
            }
        }
    }
}

/// Durable record of one subtask
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct SubTaskRecord {
    pub name: String,
    pub state: TaskState,
    pub error: Option<String>,
}
