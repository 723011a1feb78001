// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Change of the instance type of every node, one node at a time

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
pub struct ResizeNodeParams {
    #[serde(flatten)]
    pub upgrade: UpgradeTaskParams,
    pub instance_type: String,
}

pub struct ResizeNode {
    params: ResizeNodeParams,
    config: UpgradeConfig,
}

impl ResizeNode {
    pub fn new(
        params: &serde_json::Value,
        config: &UpgradeConfig,
    ) -> Result<ResizeNode, Error> {
        let params: ResizeNodeParams = parse_params(params)?;
        params.upgrade.require_rolling("resize")?;
        if params.instance_type.is_empty() {
            return Err(Error::invalid_request("instance type is empty"));
        }
        Ok(ResizeNode { params, config: config.clone() })
    }
}

impl UpgradeOperation for ResizeNode {
    fn sub_group_type(&self) -> SubTaskGroupType {
        SubTaskGroupType::ChangeInstanceType
    }

    fn node_state(&self) -> NodeState {
        NodeState::Resizing
    }

    /// The whole node is resized, so `processes` does not matter here.
    fn build_change(
        &self,
        _universe: &Universe,
        nodes: &[NodeDetails],
        _processes: &BTreeSet<ServerType>,
    ) -> Vec<SubTaskGroup> {
        let mut group =
            SubTaskGroup::new("ChangeInstanceType", self.sub_group_type());
        for node in nodes {
            group.add(RemoteCommand {
                label: "ChangeInstanceType".to_string(),
                node: node.clone(),
                argv: vec![
                    "change-instance-type".to_string(),
                    "--instance-type".to_string(),
                    self.params.instance_type.clone(),
                ],
            });
        }
        vec![group]
    }
}

#[async_trait]
impl Task for ResizeNode {
    async fn run(self: Box<Self>, ctx: &mut TaskContext) -> Result<(), Error> {
        let this = &*self;
        run_upgrade(ctx, &this.config, &this.params.upgrade, |flow| {
            let intent = &flow
                .universe()
                .primary_cluster()
                .ok_or_else(|| {
                    Error::internal_error("universe has no primary cluster")
                })?
                .user_intent;
            if intent.instance_type == this.params.instance_type {
                return Err(Error::invalid_request(&format!(
                    "instance type is already {}",
                    intent.instance_type
                )));
            }
            if flow.universe().is_kubernetes() {
                return Err(Error::invalid_request(
                    "kubernetes universes cannot be resized this way",
                ));
            }
            let context = UpgradeContext {
                // A single master cannot be taken out of its own quorum.
                reconfigure_master: intent.replication_factor > 1,
                ..Default::default()
            };
            let nodes = flow.all_nodes();
            flow.rolling_nodes(this, &nodes, &context);

            let params = this.params.clone();
            flow.add_group(SubTaskGroup::single(
                "PersistResizeNode",
                SubTaskGroupType::ChangeInstanceType,
                UpdateUniverse {
                    label: "PersistResizeNode".to_string(),
                    universe_id: params.upgrade.universe_id,
                    mutator: Arc::new(move |universe: &mut Universe| {
                        for cluster in &mut universe.clusters {
                            if params.upgrade.addresses_cluster(cluster.id) {
                                cluster.user_intent.instance_type =
                                    params.instance_type.clone();
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
