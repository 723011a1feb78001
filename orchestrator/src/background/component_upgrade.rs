// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that rolls the helper agent out to every universe

use super::epoch::select_batch;
use super::epoch::EpochState;
use super::epoch::EpochSummary;
use super::BackgroundTask;
use crate::config::ComponentUpgradeConfig;
use crate::executor::TaskExecutor;
use crate::executor::TaskType;
use crate::external::ClusterMetadataStore;
use crate::tasks::UpgradeComponentParams;
use anyhow::Context;
use fleet_common::universe::Universe;
use fleet_common::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use slog::error;
use slog::info;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Serialize)]
struct ComponentUpgradeStatus {
    enabled: bool,
    eligible: usize,
    /// universes excluded because an earlier upgrade of theirs failed
    previously_failed: Vec<Uuid>,
    error: Option<String>,
    epoch: EpochSummary,
}

pub struct ComponentUpgradeScheduler {
    executor: Arc<TaskExecutor>,
    metadata: Arc<dyn ClusterMetadataStore>,
    config: ComponentUpgradeConfig,
    /// universes whose upgrade failed; kept until no universe is eligible
    failed: BTreeSet<Uuid>,
}

impl ComponentUpgradeScheduler {
    pub fn new(
        executor: Arc<TaskExecutor>,
        metadata: Arc<dyn ClusterMetadataStore>,
        config: ComponentUpgradeConfig,
    ) -> ComponentUpgradeScheduler {
        ComponentUpgradeScheduler {
            executor,
            metadata,
            config,
            failed: BTreeSet::new(),
        }
    }

    /// Returns whether the agent on `universe` should be upgraded this
    /// epoch
    fn needs_upgrade(&self, universe: &Universe) -> bool {
        universe.component_enabled
            && !universe.paused
            && !universe.update_in_progress
            && !universe.is_kubernetes()
            && universe.component_version.as_deref()
                != Some(self.config.stable_version.as_str())
            && !self.failed.contains(&universe.id)
    }

    async fn activate(&mut self, log: &Logger) -> serde_json::Value {
        let mut status = ComponentUpgradeStatus {
            enabled: self.config.allow_scheduled_upgrade,
            ..Default::default()
        };
        if !self.config.allow_scheduled_upgrade {
            return json!(status);
        }
        if let Err(error) = self.run_epoch(log, &mut status).await {
            let message = format!("{:#}", error);
            error!(log, "component upgrade epoch failed"; "error" => &message);
            status.error = Some(message);
        }
        json!(status)
    }

    async fn run_epoch(
        &mut self,
        log: &Logger,
        status: &mut ComponentUpgradeStatus,
    ) -> Result<(), anyhow::Error> {
        let universes = self
            .metadata
            .list_universes()
            .await
            .context("listing universes")?;
        let eligible: Vec<_> = universes
            .into_iter()
            .filter(|universe| self.needs_upgrade(universe))
            .collect();
        status.eligible = eligible.len();
        status.previously_failed = self.failed.iter().copied().collect();
        if eligible.is_empty() {
            // Give the failed universes another chance once everything else
            // has converged.
            self.failed.clear();
            return Ok(());
        }

        let batch = select_batch(
            eligible,
            self.config.universe_batch_size,
            Some(self.config.node_batch_size),
            |universe| universe.nodes.len(),
        );

        let mut epoch = EpochState::new();
        for universe in &batch {
            let params = UpgradeComponentParams {
                universe_id: universe.id,
                expected_universe_version: universe.version,
                version: self.config.stable_version.clone(),
                package_location: self.config.package_location.clone(),
                probe_timeout: self.config.probe_timeout,
                result_poll_interval: self.config.result_poll_interval,
                result_max_polls: self.config.result_max_polls,
            };
            info!(
                log,
                "upgrading component";
                "universe_id" => %universe.id,
                "universe" => &universe.name,
                "from" => universe.component_version.as_deref().unwrap_or(""),
                "to" => &self.config.stable_version,
            );
            // Failures are recorded in the epoch.
            let _ = epoch
                .submit(
                    log,
                    &self.executor,
                    universe.id,
                    TaskType::UpgradeComponent,
                    json!(params),
                )
                .await;
        }

        let metadata = Arc::clone(&self.metadata);
        epoch
            .poll(
                log,
                &self.executor,
                self.config.poll_interval,
                self.config.max_poll_tries,
                |id| {
                    let metadata = Arc::clone(&metadata);
                    async move {
                        match metadata.load_universe(id).await {
                            Ok(_) => Ok(true),
                            Err(Error::ObjectNotFound { .. }) => Ok(false),
                            Err(error) => Err(error),
                        }
                    }
                },
            )
            .await;

        status.epoch = epoch.summary();
        self.failed.extend(epoch.into_failed());
        Ok(())
    }
}

impl BackgroundTask for ComponentUpgradeScheduler {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        self.activate(log).boxed()
    }
}
