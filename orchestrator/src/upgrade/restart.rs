// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::run_upgrade;
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
use std::collections::BTreeSet;

/// Restarts the processes of a universe without changing anything
pub struct RestartUniverse {
    params: UpgradeTaskParams,
    config: UpgradeConfig,
}

impl RestartUniverse {
    pub fn new(
        params: &serde_json::Value,
        config: &UpgradeConfig,
    ) -> Result<RestartUniverse, Error> {
        let params: UpgradeTaskParams = parse_params(params)?;
        params.require_restart("restart")?;
        Ok(RestartUniverse { params, config: config.clone() })
    }
}

impl UpgradeOperation for RestartUniverse {
    fn sub_group_type(&self) -> SubTaskGroupType {
        SubTaskGroupType::RestartingNodes
    }

    fn node_state(&self) -> NodeState {
        NodeState::Rebooting
    }

    fn build_change(
        &self,
        _universe: &Universe,
        _nodes: &[NodeDetails],
        _processes: &BTreeSet<ServerType>,
    ) -> Vec<SubTaskGroup> {
        Vec::new()
    }
}

#[async_trait]
impl Task for RestartUniverse {
    async fn run(self: Box<Self>, ctx: &mut TaskContext) -> Result<(), Error> {
        let this = &*self;
        run_upgrade(ctx, &this.config, &this.params, |flow| {
            let masters = flow.masters();
            let tservers = flow.tservers();
            flow.upgrade(this, &masters, &tservers, &UpgradeContext::default());
            Ok(())
        })
        .await
    }
}
