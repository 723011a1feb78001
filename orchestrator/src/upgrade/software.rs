// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Database software upgrade

use super::run_upgrade;
use super::subtasks::RemoteCommand;
use super::subtasks::UpdateUniverse;
use super::UpgradeContext;
use super::UpgradeOperation;
use super::UpgradeTaskParams;
use crate::config::UpgradeConfig;
use crate::executor::parse_params;
use crate::executor::SubTaskGroup;
use crate::executor::SubTaskGroupType;
use crate::executor::Task;
use crate::executor::TaskContext;
use async_trait::async_trait;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::NodeState;
use fleet_common::universe::ServerType;
use fleet_common::universe::Universe;
use fleet_common::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct SoftwareUpgradeParams {
    #[serde(flatten)]
    pub upgrade: UpgradeTaskParams,
    /// version to install
    pub software_version: String,
}

/// Installs a new database release on every addressed node
pub struct SoftwareUpgrade {
    params: SoftwareUpgradeParams,
    config: UpgradeConfig,
}

impl SoftwareUpgrade {
    pub fn new(
        params: &serde_json::Value,
        config: &UpgradeConfig,
    ) -> Result<SoftwareUpgrade, Error> {
        let params: SoftwareUpgradeParams = parse_params(params)?;
        params.upgrade.require_restart("software upgrade")?;
        if params.software_version.is_empty() {
            return Err(Error::invalid_request("software version is empty"));
        }
        Ok(SoftwareUpgrade { params, config: config.clone() })
    }

    fn version(&self) -> &str {
        &self.params.software_version
    }
}

impl UpgradeOperation for SoftwareUpgrade {
    fn sub_group_type(&self) -> SubTaskGroupType {
        SubTaskGroupType::UpgradingSoftware
    }

    fn node_state(&self) -> NodeState {
        NodeState::UpgradeSoftware
    }

    fn build_change(
        &self,
        _universe: &Universe,
        nodes: &[NodeDetails],
        processes: &BTreeSet<ServerType>,
    ) -> Vec<SubTaskGroup> {
        let mut group =
            SubTaskGroup::new("InstallingSoftware", self.sub_group_type());
        for node in nodes {
            for process in processes {
                group.add(RemoteCommand {
                    label: "InstallSoftware".to_string(),
                    node: node.clone(),
                    argv: vec![
                        "install-software".to_string(),
                        "--version".to_string(),
                        self.version().to_string(),
                        "--process".to_string(),
                        process.to_string(),
                    ],
                });
            }
        }
        vec![group]
    }
}

#[async_trait]
impl Task for SoftwareUpgrade {
    async fn run(self: Box<Self>, ctx: &mut TaskContext) -> Result<(), Error> {
        let this = &*self;
        run_upgrade(ctx, &this.config, &this.params.upgrade, |flow| {
            let version = this.version().to_string();
            let current = flow
                .universe()
                .primary_cluster()
                .map(|c| c.user_intent.software_version.clone())
                .ok_or_else(|| {
                    Error::internal_error("universe has no primary cluster")
                })?;
            if current == version {
                return Err(Error::invalid_request(&format!(
                    "software version is already {}",
                    version
                )));
            }

            let nodes = flow.all_nodes();
            let mut download = SubTaskGroup::new(
                "DownloadingSoftware",
                SubTaskGroupType::DownloadingSoftware,
            );
            for node in &nodes {
                download.add(RemoteCommand {
                    label: "DownloadSoftware".to_string(),
                    node: node.clone(),
                    argv: vec![
                        "download-software".to_string(),
                        "--version".to_string(),
                        version.clone(),
                    ],
                });
            }
            flow.add_group(download);

            let check_version = version.clone();
            let context = UpgradeContext {
                post_action: Some(Arc::new(move |node: &NodeDetails| {
                    SubTaskGroup::single(
                        "CheckSoftwareVersion",
                        SubTaskGroupType::UpgradingSoftware,
                        RemoteCommand {
                            label: "CheckSoftwareVersion".to_string(),
                            node: node.clone(),
                            argv: vec![
                                "check-software-version".to_string(),
                                "--version".to_string(),
                                check_version.clone(),
                            ],
                        },
                    )
                })),
                ..Default::default()
            };
            let masters = flow.masters();
            let tservers = flow.tservers();
            flow.upgrade(this, &masters, &tservers, &context);

            let params = flow.params().clone();
            flow.add_group(SubTaskGroup::single(
                "UpdateSoftwareVersion",
                SubTaskGroupType::ConfigureUniverse,
                UpdateUniverse {
                    label: "UpdateSoftwareVersion".to_string(),
                    universe_id: params.universe_id,
                    mutator: Arc::new(move |universe: &mut Universe| {
                        for cluster in &mut universe.clusters {
                            if params.addresses_cluster(cluster.id) {
                                cluster.user_intent.software_version =
                                    version.clone();
                            }
                        }
                        Ok(())
                    }),
                },
            ));
            Ok(())
        })
        .await
    }
}
