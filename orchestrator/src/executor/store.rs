// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence of task records

use super::task::TaskId;
use super::task::TaskInfo;
use async_trait::async_trait;
use fleet_common::Error;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Storage for [`TaskInfo`] records
///
/// The executor writes the whole record on every state change, so a process
/// that dies mid-task leaves the last recorded progress behind for audit.
#[async_trait]
pub trait TaskInfoStore: Send + Sync {
    async fn upsert(&self, info: TaskInfo) -> Result<(), Error>;
    async fn get(&self, id: TaskId) -> Result<Option<TaskInfo>, Error>;
    async fn list(&self) -> Result<Vec<TaskInfo>, Error>;
}

/// [`TaskInfoStore`] that keeps records in memory
#[derive(Default)]
pub struct InMemoryTaskInfoStore {
    tasks: Mutex<BTreeMap<TaskId, TaskInfo>>,
}

impl InMemoryTaskInfoStore {
    pub fn new() -> InMemoryTaskInfoStore {
        InMemoryTaskInfoStore::default()
    }
}

#[async_trait]
impl TaskInfoStore for InMemoryTaskInfoStore {
    async fn upsert(&self, info: TaskInfo) -> Result<(), Error> {
        self.tasks.lock().unwrap().insert(info.id, info);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskInfo>, Error> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<TaskInfo>, Error> {
        let mut tasks: Vec<_> =
            self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| t.time_created);
        Ok(tasks)
    }
}
