// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping for one activation ("epoch") of a batch scheduler
//!
//! A scheduler picks a batch of targets with [`select_batch()`], submits one
//! task per target through [`EpochState::submit()`] and then waits for them
//! with [`EpochState::poll()`].  The state is created at the start of an
//! epoch and consumed at its end: whatever the scheduler wants to carry into
//! the next epoch (typically the failed set) it takes out explicitly.

use crate::executor::TaskExecutor;
use crate::executor::TaskId;
use crate::executor::TaskState;
use crate::executor::TaskType;
use fleet_common::Error;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Picks the targets for one epoch, in the order given
///
/// At most `max_count` candidates are selected.  When `max_weight` is set,
/// selection also stops at the first candidate that would take the total
/// weight past it, except that the first candidate is always accepted (so
/// that one oversized target cannot starve forever).
pub fn select_batch<T, W>(
    candidates: impl IntoIterator<Item = T>,
    max_count: usize,
    max_weight: Option<usize>,
    weight: W,
) -> Vec<T>
where
    W: Fn(&T) -> usize,
{
    let mut selected = Vec::new();
    let mut total = 0;
    for candidate in candidates {
        if selected.len() >= max_count {
            break;
        }
        let w = weight(&candidate);
        if let Some(max_weight) = max_weight {
            if !selected.is_empty() && total + w > max_weight {
                break;
            }
        }
        total += w;
        selected.push(candidate);
    }
    selected
}

/// Targets of the current epoch, by outcome
#[derive(Debug, Default)]
pub struct EpochState {
    in_flight: BTreeMap<Uuid, TaskId>,
    completed: BTreeSet<Uuid>,
    failed: BTreeSet<Uuid>,
    /// targets whose record disappeared while their task was in flight
    gone: BTreeSet<Uuid>,
}

/// What an epoch did, as reported in a background task's status
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EpochSummary {
    pub submitted: usize,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub gone: Vec<Uuid>,
}

impl EpochState {
    pub fn new() -> EpochState {
        EpochState::default()
    }

    pub fn is_in_flight(&self, target: Uuid) -> bool {
        self.in_flight.contains_key(&target)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn failed(&self) -> &BTreeSet<Uuid> {
        &self.failed
    }

    /// Marks a target failed without submitting anything for it
    pub fn mark_failed(&mut self, target: Uuid) {
        self.in_flight.remove(&target);
        self.failed.insert(target);
    }

    /// Submits the task for `target` and tracks it as in flight
    ///
    /// A rejected submission marks the target failed.
    pub async fn submit(
        &mut self,
        log: &Logger,
        executor: &TaskExecutor,
        target: Uuid,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> Result<TaskId, Error> {
        match executor.submit(task_type, params).await {
            Ok(task_id) => {
                debug!(
                    log,
                    "submitted task";
                    "target" => %target,
                    "task_id" => %task_id,
                );
                self.in_flight.insert(target, task_id);
                Ok(task_id)
            }
            Err(error) => {
                warn!(
                    log,
                    "failed to submit task";
                    "target" => %target,
                    "task_type" => %task_type,
                    "error" => %error,
                );
                self.failed.insert(target);
                Err(error)
            }
        }
    }

    /// Waits for the in-flight tasks to finish
    ///
    /// Sleeps `interval` between checks, for at most `max_tries` checks.  A
    /// target for which `exists` reports `false` was deleted behind our back
    /// and is dropped.  Targets whose task fails, and targets still in
    /// flight once the checks are used up, are marked failed.
    pub async fn poll<F, Fut>(
        &mut self,
        log: &Logger,
        executor: &TaskExecutor,
        interval: Duration,
        max_tries: u32,
        mut exists: F,
    ) where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = Result<bool, Error>>,
    {
        let mut tries = 0;
        while !self.in_flight.is_empty() && tries < max_tries {
            tries += 1;
            tokio::time::sleep(interval).await;

            let in_flight: Vec<_> =
                self.in_flight.iter().map(|(t, id)| (*t, *id)).collect();
            for (target, task_id) in in_flight {
                match exists(target).await {
                    Ok(true) => (),
                    Ok(false) => {
                        info!(log, "target went away"; "target" => %target);
                        self.in_flight.remove(&target);
                        self.gone.insert(target);
                        continue;
                    }
                    Err(error) => {
                        warn!(
                            log,
                            "failed to look up target";
                            "target" => %target,
                            "error" => %error,
                        );
                        continue;
                    }
                }

                let info = match executor.get_task_status(task_id).await {
                    Ok(info) => info,
                    Err(error) => {
                        warn!(
                            log,
                            "failed to get task status";
                            "task_id" => %task_id,
                            "error" => %error,
                        );
                        continue;
                    }
                };
                if !info.state.is_terminal() {
                    continue;
                }
                self.in_flight.remove(&target);
                if info.state == TaskState::Success {
                    self.completed.insert(target);
                } else {
                    warn!(
                        log,
                        "task did not succeed";
                        "target" => %target,
                        "task_id" => %task_id,
                        "state" => %info.state,
                        "error" => info.error.as_deref().unwrap_or(""),
                    );
                    self.failed.insert(target);
                }
            }
        }

        if !self.in_flight.is_empty() {
            warn!(
                log,
                "gave up waiting for tasks";
                "remaining" => self.in_flight.len(),
                "tries" => tries,
            );
            let remaining = std::mem::take(&mut self.in_flight);
            self.failed.extend(remaining.into_keys());
        }
    }

    pub fn summary(&self) -> EpochSummary {
        EpochSummary {
            submitted: self.in_flight.len()
                + self.completed.len()
                + self.failed.len()
                + self.gone.len(),
            completed: self.completed.iter().copied().collect(),
            failed: self.failed.iter().copied().collect(),
            gone: self.gone.iter().copied().collect(),
        }
    }

    /// Ends the epoch, returning the targets that failed in it
    pub fn into_failed(self) -> BTreeSet<Uuid> {
        self.failed
    }
}
