// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade of the helper agent on the nodes of one universe

use crate::executor::parse_params;
use crate::executor::SubTask;
use crate::executor::SubTaskContext;
use crate::executor::SubTaskGroup;
use crate::executor::SubTaskGroupType;
use crate::executor::Task;
use crate::executor::TaskContext;
use crate::external::ComponentAgent;
use crate::external::ComponentUpgradeResult;
use crate::lock;
use async_trait::async_trait;
use fleet_common::poll;
use fleet_common::poll::wait_for_condition_attempts;
use fleet_common::poll::CondCheckError;
use fleet_common::universe::NodeDetails;
use fleet_common::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[serde_as]
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct UpgradeComponentParams {
    pub universe_id: Uuid,
    pub expected_universe_version: u64,
    /// helper agent version to install
    pub version: String,
    pub package_location: String,
    /// how long a node's agent has to answer before the node is skipped
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "probe_timeout_ms")]
    #[schemars(with = "u64")]
    pub probe_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "result_poll_interval_ms")]
    #[schemars(with = "u64")]
    pub result_poll_interval: Duration,
    pub result_max_polls: u32,
}

pub struct UpgradeComponent {
    params: UpgradeComponentParams,
}

impl UpgradeComponent {
    pub fn new(params: &serde_json::Value) -> Result<UpgradeComponent, Error> {
        let params: UpgradeComponentParams = parse_params(params)?;
        if params.version.is_empty() {
            return Err(Error::invalid_request("component version is empty"));
        }
        Ok(UpgradeComponent { params })
    }
}

#[async_trait]
impl Task for UpgradeComponent {
    async fn run(self: Box<Self>, ctx: &mut TaskContext) -> Result<(), Error> {
        let params = &self.params;
        let log = ctx.log().clone();
        let services = ctx.services().clone();
        lock::run_locked(
            &log,
            &*services.metadata,
            params.universe_id,
            params.expected_universe_version,
            |universe| async move {
                let skipped = Arc::new(Mutex::new(BTreeSet::new()));
                let mut group = SubTaskGroup::new(
                    "UpgradeComponent",
                    SubTaskGroupType::UpgradingComponent,
                );
                for node in &universe.nodes {
                    group.add(UpgradeComponentOnNode {
                        node: node.clone(),
                        params: params.clone(),
                        skipped: Arc::clone(&skipped),
                    });
                }
                ctx.add_subtask_group(group);
                ctx.add_subtask_group(SubTaskGroup::single(
                    "UpdateComponentVersion",
                    SubTaskGroupType::ConfigureUniverse,
                    UpdateComponentVersion {
                        universe_id: universe.id,
                        version: params.version.clone(),
                        skipped,
                    },
                ));
                ctx.run_subtasks().await
            },
        )
        .await
    }
}

/// Upgrades the agent on one node
///
/// A node whose agent does not answer is skipped.  If the upgrade from the
/// shared package location fails, it is retried once from a package staged
/// on the node itself.
struct UpgradeComponentOnNode {
    node: NodeDetails,
    params: UpgradeComponentParams,
    skipped: Arc<Mutex<BTreeSet<String>>>,
}

impl UpgradeComponentOnNode {
    async fn attempt(
        &self,
        log: &Logger,
        agent: &dyn ComponentAgent,
        location: &str,
    ) -> Result<(), Error> {
        let version = &self.params.version;
        agent.request_upgrade(&self.node, version, location).await?;
        let result = wait_for_condition_attempts(
            || async {
                match agent
                    .upgrade_result(&self.node, version)
                    .await
                    .map_err(CondCheckError::Failed)?
                {
                    ComponentUpgradeResult::Complete => Ok(()),
                    ComponentUpgradeResult::InProgress => {
                        Err(CondCheckError::NotYet)
                    }
                    ComponentUpgradeResult::Failed => {
                        Err(CondCheckError::Failed(Error::remote_command_failed(
                            &self.node.node_name,
                            &format!("upgrade to {} failed", version),
                        )))
                    }
                }
            },
            &self.params.result_poll_interval,
            self.params.result_max_polls,
        )
        .await;
        match result {
            Ok(()) => {
                info!(log, "upgraded component"; "location" => location);
                Ok(())
            }
            Err(poll::Error::PermanentError(error)) => Err(error),
            Err(error) => Err(Error::timeout(
                &format!("component upgrade on {}", self.node),
                error.elapsed().unwrap_or_default(),
            )),
        }
    }
}

#[async_trait]
impl SubTask for UpgradeComponentOnNode {
    fn name(&self) -> String {
        format!("UpgradeComponent({})", self.node.node_name)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let agent = &*ctx.services.components;
        let reachable = match agent
            .probe(&self.node, self.params.probe_timeout)
            .await
        {
            Ok(reachable) => reachable,
            Err(error) => {
                warn!(ctx.log, "failed to probe component"; "error" => %error);
                false
            }
        };
        if !reachable {
            warn!(ctx.log, "skipping unreachable node");
            self.skipped.lock().unwrap().insert(self.node.node_name.clone());
            return Ok(());
        }

        let first = self
            .attempt(&ctx.log, agent, &self.params.package_location)
            .await;
        let Err(error) = first else {
            return Ok(());
        };
        warn!(
            ctx.log,
            "component upgrade failed, retrying with a local package";
            "error" => %error,
        );
        let location =
            agent.stage_local_package(&self.node, &self.params.version).await?;
        self.attempt(&ctx.log, agent, &location).await
    }
}

/// Records the new agent version on the universe, unless some node was
/// skipped
struct UpdateComponentVersion {
    universe_id: Uuid,
    version: String,
    skipped: Arc<Mutex<BTreeSet<String>>>,
}

#[async_trait]
impl SubTask for UpdateComponentVersion {
    fn name(&self) -> String {
        format!("UpdateComponentVersion({})", self.version)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let skipped = self.skipped.lock().unwrap().clone();
        if !skipped.is_empty() {
            warn!(
                ctx.log,
                "not recording component version: nodes were skipped";
                "skipped" => ?skipped,
            );
            return Ok(());
        }
        let version = self.version.clone();
        lock::update_locked(
            &*ctx.services.metadata,
            self.universe_id,
            move |universe| {
                universe.component_version = Some(version);
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}
