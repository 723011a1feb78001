// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rotation of node-to-node and client-to-node TLS certificates

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
use fleet_common::universe::UserIntent;
use fleet_common::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CertsRotateParams {
    #[serde(flatten)]
    pub upgrade: UpgradeTaskParams,
    /// new root CA for node-to-node encryption
    #[serde(default)]
    pub root_ca: Option<Uuid>,
    /// new root CA for client-to-node encryption
    #[serde(default)]
    pub client_root_ca: Option<Uuid>,
}

pub struct CertsRotate {
    params: CertsRotateParams,
    config: UpgradeConfig,
}

impl CertsRotate {
    pub fn new(
        params: &serde_json::Value,
        config: &UpgradeConfig,
    ) -> Result<CertsRotate, Error> {
        let params: CertsRotateParams = parse_params(params)?;
        params.upgrade.require_restart("certificate rotation")?;
        if params.root_ca.is_none() && params.client_root_ca.is_none() {
            return Err(Error::invalid_request(
                "no certificate to rotate was given",
            ));
        }
        Ok(CertsRotate { params, config: config.clone() })
    }

    /// Checks that every certificate being rotated is one the universe
    /// actually uses and that something changes.
    fn validate(&self, intent: &UserIntent) -> Result<(), Error> {
        let mut changed = false;
        if let Some(root_ca) = self.params.root_ca {
            if !intent.enable_node_to_node_encrypt {
                return Err(Error::invalid_request(
                    "node-to-node encryption is not enabled",
                ));
            }
            changed |= intent.root_ca != Some(root_ca);
        }
        if let Some(client_root_ca) = self.params.client_root_ca {
            if !intent.enable_client_to_node_encrypt {
                return Err(Error::invalid_request(
                    "client-to-node encryption is not enabled",
                ));
            }
            changed |= intent.client_root_ca != Some(client_root_ca);
        }
        if !changed {
            return Err(Error::invalid_request(
                "certificates are already up to date",
            ));
        }
        Ok(())
    }
}

impl UpgradeOperation for CertsRotate {
    fn sub_group_type(&self) -> SubTaskGroupType {
        SubTaskGroupType::RotatingCert
    }

    fn node_state(&self) -> NodeState {
        NodeState::UpdateCert
    }

    fn build_change(
        &self,
        _universe: &Universe,
        nodes: &[NodeDetails],
        processes: &BTreeSet<ServerType>,
    ) -> Vec<SubTaskGroup> {
        let mut group = SubTaskGroup::new("RotatingCert", self.sub_group_type());
        for node in nodes {
            for process in processes {
                let mut argv = vec![
                    "rotate-certs".to_string(),
                    "--process".to_string(),
                    process.to_string(),
                ];
                if let Some(root_ca) = self.params.root_ca {
                    argv.push("--root-ca".to_string());
                    argv.push(root_ca.to_string());
                }
                if let Some(client_root_ca) = self.params.client_root_ca {
                    argv.push("--client-root-ca".to_string());
                    argv.push(client_root_ca.to_string());
                }
                group.add(RemoteCommand {
                    label: "RotateCerts".to_string(),
                    node: node.clone(),
                    argv,
                });
            }
        }
        vec![group]
    }
}

#[async_trait]
impl Task for CertsRotate {
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
            this.validate(intent)?;

            // New certificates are staged while the old ones are still in
            // use, then picked up on restart.
            let context =
                UpgradeContext { run_before_stopping: true, ..Default::default() };
            let masters = flow.masters();
            let tservers = flow.tservers();
            flow.upgrade(this, &masters, &tservers, &context);

            let params = this.params.clone();
            flow.add_group(SubTaskGroup::single(
                "UpdateUniverseCerts",
                SubTaskGroupType::ConfigureUniverse,
                UpdateUniverse {
                    label: "UpdateUniverseCerts".to_string(),
                    universe_id: params.upgrade.universe_id,
                    mutator: Arc::new(move |universe: &mut Universe| {
                        for cluster in &mut universe.clusters {
                            if !params.upgrade.addresses_cluster(cluster.id) {
                                continue;
                            }
                            let intent = &mut cluster.user_intent;
                            if params.root_ca.is_some() {
                                intent.root_ca = params.root_ca;
                            }
                            if params.client_root_ca.is_some() {
                                intent.client_root_ca = params.client_root_ca;
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
