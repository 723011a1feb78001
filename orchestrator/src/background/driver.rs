// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manages execution of background tasks

use super::ActivationReason;
use super::BackgroundTask;
use super::CurrentStatus;
use super::CurrentStatusRunning;
use super::LastResult;
use super::LastResultCompleted;
use super::TaskName;
use super::TaskStatus;
use chrono::Utc;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Runs the periodic background tasks of the orchestrator
///
/// Every registered task gets its own tokio task, which activates it on its
/// period or on request and publishes its status on a watch channel.
pub struct Driver {
    tasks: BTreeMap<TaskName, Task>,
}

struct Task {
    description: String,
    period: Duration,
    status: watch::Receiver<TaskStatus>,
    handle: tokio::task::JoinHandle<()>,
    /// wakes the task's loop for an activation on request
    notify: Arc<Notify>,
}

impl Driver {
    pub fn new() -> Driver {
        Driver { tasks: BTreeMap::new() }
    }

    /// Starts running `imp` as the background task `name`
    ///
    /// The task is activated right away, then whenever it has not run for
    /// `period`, and whenever a caller asks for it with
    /// [`Driver::activate()`].  Panics if `name` is already registered.
    pub fn register(
        &mut self,
        log: &Logger,
        name: &str,
        description: &str,
        period: Duration,
        imp: Box<dyn BackgroundTask>,
    ) -> TaskName {
        let (status_tx, status_rx) = watch::channel(TaskStatus {
            current: CurrentStatus::Idle,
            last: LastResult::NeverCompleted,
        });
        let notify = Arc::new(Notify::new());
        let log = log.new(o!("background_task" => name.to_string()));
        let exec = TaskExec {
            period,
            imp,
            notify: Arc::clone(&notify),
            log,
            status_tx,
            iteration: 0,
        };
        let task = Task {
            description: description.to_string(),
            period,
            status: status_rx,
            handle: tokio::task::spawn(exec.run()),
            notify,
        };
        let name = TaskName(name.to_string());
        if self.tasks.insert(name.clone(), task).is_some() {
            panic!("started two background tasks called {:?}", name);
        }
        name
    }

    /// Returns the names of the registered tasks, in name order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.keys()
    }

    fn task_required(&self, task: &TaskName) -> &Task {
        // Names only come from `register`.
        self.tasks.get(task).unwrap_or_else(|| {
            panic!("attempted to get non-existent background task: {:?}", task)
        })
    }

    pub fn task_description(&self, task: &TaskName) -> &str {
        &self.task_required(task).description
    }

    pub fn task_period(&self, task: &TaskName) -> Duration {
        self.task_required(task).period
    }

    /// Asks for an activation of `task` outside of its period
    ///
    /// Requests made while the task runs collapse into one more activation
    /// once it finishes.
    pub fn activate(&self, task: &TaskName) {
        self.task_required(task).notify.notify_one();
    }

    /// Returns a snapshot of the task's status
    pub fn task_status(&self, task: &TaskName) -> TaskStatus {
        // A held borrow would block the task's status updates.
        self.task_required(task).status.borrow().clone()
    }

    /// Returns a receiver that observes every status change of the task
    pub fn watch_status(&self, task: &TaskName) -> watch::Receiver<TaskStatus> {
        self.task_required(task).status.clone()
    }
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.handle.abort();
        }
    }
}

/// The loop that activates one background task
struct TaskExec {
    period: Duration,
    imp: Box<dyn BackgroundTask>,
    notify: Arc<Notify>,
    log: Logger,
    status_tx: watch::Sender<TaskStatus>,
    iteration: u64,
}

impl TaskExec {
    async fn run(mut self) {
        // The first tick completes immediately.  A late activation pushes
        // the following ticks back instead of bunching them up.
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.activate(ActivationReason::Timeout).await;
                },

                _ = self.notify.notified() => {
                    self.activate(ActivationReason::Signaled).await;
                }
            }
        }
    }

    /// Runs one activation, publishing the status before and after it
    async fn activate(&mut self, reason: ActivationReason) {
        self.iteration += 1;
        let iteration = self.iteration;
        let start_time = Utc::now();
        let start_instant = Instant::now();

        debug!(
            &self.log,
            "activating";
            "reason" => ?reason,
            "iteration" => iteration
        );

        self.status_tx.send_modify(|status| {
            status.current = CurrentStatus::Running(CurrentStatusRunning {
                start_time,
                start_instant,
                reason,
                iteration,
            });
        });

        let details = self.imp.activate(&self.log).await;

        let elapsed = start_instant.elapsed();

        self.status_tx.send_modify(|status| {
            *status = TaskStatus {
                current: CurrentStatus::Idle,
                last: LastResult::Completed(LastResultCompleted {
                    iteration,
                    start_time,
                    reason,
                    elapsed,
                    details,
                }),
            };
        });

        debug!(
            &self.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
        );
    }
}
