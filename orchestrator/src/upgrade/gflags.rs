// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Changes to the runtime flags of master and tserver processes

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
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct GFlagsUpgradeParams {
    #[serde(flatten)]
    pub upgrade: UpgradeTaskParams,
    #[serde(default)]
    pub master_gflags: BTreeMap<String, String>,
    #[serde(default)]
    pub tserver_gflags: BTreeMap<String, String>,
}

/// Rewrites the flag files of every addressed node
pub struct GFlagsUpgrade {
    params: GFlagsUpgradeParams,
    config: UpgradeConfig,
}

impl GFlagsUpgrade {
    pub fn new(
        params: &serde_json::Value,
        config: &UpgradeConfig,
    ) -> Result<GFlagsUpgrade, Error> {
        let params: GFlagsUpgradeParams = parse_params(params)?;
        Ok(GFlagsUpgrade { params, config: config.clone() })
    }

    fn flags_for(&self, process: ServerType) -> &BTreeMap<String, String> {
        match process {
            ServerType::Master => &self.params.master_gflags,
            _ => &self.params.tserver_gflags,
        }
    }
}

/// Returns the names of flags set in `old` that `new` no longer sets.
fn removed_flags(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Vec<String> {
    old.keys().filter(|k| !new.contains_key(*k)).cloned().collect()
}

impl UpgradeOperation for GFlagsUpgrade {
    fn sub_group_type(&self) -> SubTaskGroupType {
        SubTaskGroupType::UpdatingGFlags
    }

    fn node_state(&self) -> NodeState {
        NodeState::UpdateGFlags
    }

    fn build_change(
        &self,
        universe: &Universe,
        nodes: &[NodeDetails],
        processes: &BTreeSet<ServerType>,
    ) -> Vec<SubTaskGroup> {
        let mut group =
            SubTaskGroup::new("UpdatingGFlags", self.sub_group_type());
        for node in nodes {
            let intent =
                universe.cluster(node.placement_uuid).map(|c| &c.user_intent);
            for &process in processes {
                let new = self.flags_for(process);
                let old = intent.map(|intent| match process {
                    ServerType::Master => &intent.master_gflags,
                    _ => &intent.tserver_gflags,
                });
                let mut argv = vec![
                    "update-gflags".to_string(),
                    "--process".to_string(),
                    process.to_string(),
                ];
                for (name, value) in new {
                    argv.push("--flag".to_string());
                    argv.push(format!("{}={}", name, value));
                }
                if let Some(old) = old {
                    for name in removed_flags(old, new) {
                        argv.push("--remove-flag".to_string());
                        argv.push(name);
                    }
                }
                group.add(RemoteCommand {
                    label: "UpdateGFlags".to_string(),
                    node: node.clone(),
                    argv,
                });
            }
        }
        vec![group]
    }
}

#[async_trait]
impl Task for GFlagsUpgrade {
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
            let masters_changed = intent.master_gflags != this.params.master_gflags;
            let tservers_changed =
                intent.tserver_gflags != this.params.tserver_gflags;
            if !masters_changed && !tservers_changed {
                return Err(Error::invalid_request("no gflags changed"));
            }

            let masters =
                if masters_changed { flow.masters() } else { Vec::new() };
            let tservers =
                if tservers_changed { flow.tservers() } else { Vec::new() };
            let context = UpgradeContext {
                run_before_stopping: true,
                process_inactive_master: masters_changed,
                ..Default::default()
            };
            flow.upgrade(this, &masters, &tservers, &context);

            let params = this.params.clone();
            flow.add_group(SubTaskGroup::single(
                "UpdateGFlagsInUserIntent",
                SubTaskGroupType::ConfigureUniverse,
                UpdateUniverse {
                    label: "UpdateGFlagsInUserIntent".to_string(),
                    universe_id: params.upgrade.universe_id,
                    mutator: Arc::new(move |universe: &mut Universe| {
                        for cluster in &mut universe.clusters {
                            if params.upgrade.addresses_cluster(cluster.id) {
                                let intent = &mut cluster.user_intent;
                                intent.master_gflags =
                                    params.master_gflags.clone();
                                intent.tserver_gflags =
                                    params.tserver_gflags.clone();
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_removed_flags() {
        let old = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let new = BTreeMap::from([
            ("b".to_string(), "3".to_string()),
            ("c".to_string(), "4".to_string()),
        ]);
        assert_eq!(removed_flags(&old, &new), vec!["a".to_string()]);
        assert!(removed_flags(&new, &new).is_empty());
    }
}
