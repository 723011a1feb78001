// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutations of a running universe that touch its nodes one role at a time
//!
//! Every operation here (software upgrade, flag change, certificate
//! rotation, restart, resize) shares the same skeleton, implemented by
//! [`engine`]: lock the universe, decide which nodes to touch and in which
//! order, and emit for each node the subtasks that take it out of service,
//! apply the change and bring it back.  What differs between operations is
//! captured by [`UpgradeOperation`]: the node-local change itself, the node
//! state recorded while it is applied and the kind of group it runs in.

mod certs;
pub mod engine;
mod gflags;
mod resize;
mod restart;
mod software;
pub mod subtasks;

pub use certs::CertsRotate;
pub use certs::CertsRotateParams;
pub use engine::run_upgrade;
pub use engine::UpgradeFlow;
pub use gflags::GFlagsUpgrade;
pub use gflags::GFlagsUpgradeParams;
pub use resize::ResizeNode;
pub use resize::ResizeNodeParams;
pub use restart::RestartUniverse;
pub use software::SoftwareUpgrade;
pub use software::SoftwareUpgradeParams;

use crate::executor::SubTaskGroup;
use crate::executor::SubTaskGroupType;
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
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// How the nodes of a universe are taken through a change
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOption {
    /// one node at a time, keeping the rest of the universe serving
    Rolling,
    /// every node of a role at once
    NonRolling,
    /// apply the change without stopping any process
    NonRestart,
}

/// Parameters shared by every upgrade-class task
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct UpgradeTaskParams {
    pub universe_id: Uuid,
    /// version of the universe the caller planned the change against
    pub expected_universe_version: u64,
    pub upgrade_option: UpgradeOption,
    /// clusters to touch; empty means every cluster of the universe
    #[serde(default)]
    pub cluster_ids: Vec<Uuid>,
    #[serde(default)]
    pub sleep_after_master_restart_ms: u64,
    #[serde(default)]
    pub sleep_after_tserver_restart_ms: u64,
}

impl UpgradeTaskParams {
    /// Rejects the no-restart strategy for operations that need processes
    /// to restart
    pub fn require_restart(&self, operation: &str) -> Result<(), Error> {
        if self.upgrade_option == UpgradeOption::NonRestart {
            return Err(Error::invalid_request(&format!(
                "{} requires a rolling or non-rolling upgrade",
                operation
            )));
        }
        Ok(())
    }

    pub fn require_rolling(&self, operation: &str) -> Result<(), Error> {
        if self.upgrade_option != UpgradeOption::Rolling {
            return Err(Error::invalid_request(&format!(
                "{} only supports rolling upgrades",
                operation
            )));
        }
        Ok(())
    }

    /// Returns how long to let `process` settle after it restarts.
    pub fn sleep_after_restart(&self, process: ServerType) -> Duration {
        match process {
            ServerType::Master => {
                Duration::from_millis(self.sleep_after_master_restart_ms)
            }
            _ => Duration::from_millis(self.sleep_after_tserver_restart_ms),
        }
    }

    /// Returns whether the upgrade addresses cluster `cluster_id`.
    pub fn addresses_cluster(&self, cluster_id: Uuid) -> bool {
        self.cluster_ids.is_empty() || self.cluster_ids.contains(&cluster_id)
    }
}

/// Work emitted after a node's processes are back, before it is marked live
pub type PostAction = Arc<dyn Fn(&NodeDetails) -> SubTaskGroup + Send + Sync>;

/// Knobs an operation sets for one pass of the upgrade flow
#[derive(Clone, Default)]
pub struct UpgradeContext {
    /// remove each master from the quorum while it is down and add it back
    /// once it is up again
    pub reconfigure_master: bool,
    /// apply the change before stopping processes rather than while they
    /// are stopped
    pub run_before_stopping: bool,
    /// also take tservers of the primary cluster that do not run an active
    /// master through the master pass (without restarting anything)
    pub process_inactive_master: bool,
    /// leave stopped processes down; the waits for them still run
    pub skip_starting_processes: bool,
    pub post_action: Option<PostAction>,
}

/// What one kind of upgrade does to a node
///
/// The engine calls [`UpgradeOperation::build_change`] at the point of its
/// flow where the change belongs and runs the returned groups in order.
pub trait UpgradeOperation: Send + Sync {
    /// kind of group the node-local change runs in
    fn sub_group_type(&self) -> SubTaskGroupType;

    /// state recorded on a node while the change is applied to it
    fn node_state(&self) -> NodeState;

    /// Returns the groups applying the change to `nodes` for the processes
    /// in `processes`.  An empty result means there is nothing to do on the
    /// node itself.
    fn build_change(
        &self,
        universe: &Universe,
        nodes: &[NodeDetails],
        processes: &BTreeSet<ServerType>,
    ) -> Vec<SubTaskGroup>;
}

/// Changes to the universe's serving state made by a running upgrade that
/// must be undone if it fails
///
/// Subtasks update this as they act, so after a failure it reflects exactly
/// what was done rather than what was planned.
#[derive(Debug, Default)]
pub struct SideEffects {
    inner: Mutex<SideEffectsInner>,
}

#[derive(Debug, Default)]
struct SideEffectsInner {
    load_balancer_disabled: bool,
    blacklisted: BTreeMap<String, NodeDetails>,
}

impl SideEffects {
    pub fn set_load_balancer_disabled(&self, disabled: bool) {
        self.inner.lock().unwrap().load_balancer_disabled = disabled;
    }

    pub fn load_balancer_disabled(&self) -> bool {
        self.inner.lock().unwrap().load_balancer_disabled
    }

    pub fn record_blacklisted(&self, nodes: &[NodeDetails]) {
        let mut inner = self.inner.lock().unwrap();
        for node in nodes {
            inner.blacklisted.insert(node.node_name.clone(), node.clone());
        }
    }

    pub fn record_unblacklisted(&self, nodes: &[NodeDetails]) {
        let mut inner = self.inner.lock().unwrap();
        for node in nodes {
            inner.blacklisted.remove(&node.node_name);
        }
    }

    /// Returns the nodes this upgrade added to the leader blacklist and has
    /// not removed since.
    pub fn blacklisted_nodes(&self) -> Vec<NodeDetails> {
        self.inner.lock().unwrap().blacklisted.values().cloned().collect()
    }
}
