// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upgrade state machine
//!
//! [`run_upgrade`] is the envelope every upgrade-class task runs in.  Inside
//! it, an operation describes its work by calling into [`UpgradeFlow`],
//! which turns "apply this change to these nodes with this strategy" into
//! the ordered subtask groups that take each node from `Live`, through the
//! operation's state, and back to `Live`.

use super::subtasks::ChangeMasterConfig;
use super::subtasks::MarkUniverseUpdateSuccess;
use super::subtasks::ModifyLeaderBlacklist;
use super::subtasks::RemoteCommand;
use super::subtasks::ServerAction;
use super::subtasks::ServerControl;
use super::subtasks::SetLoadBalancerState;
use super::subtasks::SetNodeState;
use super::subtasks::WaitForFollowerLag;
use super::subtasks::WaitForServer;
use super::subtasks::WaitForServerReady;
use super::subtasks::WaitForSqlServer;
use super::SideEffects;
use super::UpgradeContext;
use super::UpgradeOperation;
use super::UpgradeOption;
use super::UpgradeTaskParams;
use crate::config::UpgradeConfig;
use crate::executor::SubTaskGroup;
use crate::executor::SubTaskGroupType;
use crate::executor::TaskContext;
use crate::lock;
use crate::node_ordering;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::NodeState;
use fleet_common::universe::ServerType;
use fleet_common::universe::Universe;
use fleet_common::Error;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Builder for the node flow of one upgrade
///
/// Groups are queued on the task in the order the methods are called.
pub struct UpgradeFlow<'a> {
    ctx: &'a mut TaskContext,
    universe: Universe,
    params: &'a UpgradeTaskParams,
    config: &'a UpgradeConfig,
    side_effects: Arc<SideEffects>,
    masters: Vec<NodeDetails>,
    tservers: Vec<NodeDetails>,
}

impl<'a> UpgradeFlow<'a> {
    /// the universe as it was when it was locked
    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn params(&self) -> &UpgradeTaskParams {
        self.params
    }

    /// Returns the masters of the addressed clusters in processing order.
    pub fn masters(&self) -> Vec<NodeDetails> {
        self.masters.clone()
    }

    /// Returns the tservers of the addressed clusters in processing order.
    pub fn tservers(&self) -> Vec<NodeDetails> {
        self.tservers.clone()
    }

    /// Returns every addressed node once: masters first, then the tservers
    /// that do not run a master.
    pub fn all_nodes(&self) -> Vec<NodeDetails> {
        union(&self.masters, &self.tservers)
    }

    pub fn add_group(&mut self, group: SubTaskGroup) {
        self.ctx.add_subtask_group(group);
    }

    /// Emits the flow applying `op` to `masters` and `tservers` with the
    /// strategy the task was submitted with
    pub fn upgrade(
        &mut self,
        op: &dyn UpgradeOperation,
        masters: &[NodeDetails],
        tservers: &[NodeDetails],
        context: &UpgradeContext,
    ) {
        match self.params.upgrade_option {
            UpgradeOption::Rolling => {
                self.rolling(op, masters, tservers, context)
            }
            UpgradeOption::NonRolling => {
                self.non_rolling(op, masters, tservers, context)
            }
            UpgradeOption::NonRestart => {
                self.non_restart(op, masters, tservers, context)
            }
        }
    }

    /// Emits a rolling flow that takes each of `nodes` down as a whole,
    /// restarting every process it hosts
    pub fn rolling_nodes(
        &mut self,
        op: &dyn UpgradeOperation,
        nodes: &[NodeDetails],
        context: &UpgradeContext,
    ) {
        let nodes: Vec<_> = nodes
            .iter()
            .map(|n| (n.clone(), n.all_processes().into_iter().collect()))
            .collect();
        self.rolling_node_set(op, &nodes, context, true);
    }

    fn rolling(
        &mut self,
        op: &dyn UpgradeOperation,
        masters: &[NodeDetails],
        tservers: &[NodeDetails],
        context: &UpgradeContext,
    ) {
        let masters = with_processes(masters, ServerType::Master);
        self.rolling_node_set(op, &masters, context, true);
        if context.process_inactive_master {
            let inactive = node_ordering::inactive_masters(
                &self.universe,
                &self.masters,
                &self.tservers,
            );
            let inactive = with_processes(&inactive, ServerType::Master);
            self.rolling_node_set(op, &inactive, context, false);
        }
        let tservers = with_processes(tservers, ServerType::TServer);
        self.rolling_node_set(op, &tservers, context, true);
    }

    /// Takes `nodes` through `op` one at a time
    ///
    /// Nodes with `active_role` unset host a process that is not serving
    /// (an inactive master): the change is applied but nothing is started or
    /// waited on.
    fn rolling_node_set(
        &mut self,
        op: &dyn UpgradeOperation,
        nodes: &[(NodeDetails, BTreeSet<ServerType>)],
        context: &UpgradeContext,
        active_role: bool,
    ) {
        if nodes.is_empty() {
            return;
        }
        let universe_id = self.universe.id;
        let has_tserver =
            nodes.iter().any(|(_, p)| p.contains(&ServerType::TServer));
        let blacklist = has_tserver && self.config.blacklist_leaders;
        let disable_load_balancer = has_tserver && !blacklist;

        if blacklist {
            // Clear stale entries left behind by an earlier run.
            let tservers: Vec<_> = nodes
                .iter()
                .filter(|(n, _)| n.is_tserver)
                .map(|(n, _)| n.clone())
                .collect();
            self.add_group(SubTaskGroup::single(
                "ModifyBlackList",
                SubTaskGroupType::ConfigureUniverse,
                ModifyLeaderBlacklist {
                    universe_id,
                    nodes: tservers,
                    add: false,
                    side_effects: Arc::clone(&self.side_effects),
                },
            ));
        }
        if disable_load_balancer {
            self.add_group(self.load_balancer_group(false));
        }

        for (node, processes) in nodes {
            self.rolling_node(op, node, processes, context, active_role, blacklist);
        }

        if disable_load_balancer {
            self.add_group(self.load_balancer_group(true));
        }
    }

    fn rolling_node(
        &mut self,
        op: &dyn UpgradeOperation,
        node: &NodeDetails,
        processes: &BTreeSet<ServerType>,
        context: &UpgradeContext,
        active_role: bool,
        blacklist: bool,
    ) {
        let universe_id = self.universe.id;
        let group_type = op.sub_group_type();
        let config = self.config;
        let nodes = std::slice::from_ref(node);
        let blacklist_node = blacklist
            && active_role
            && node.is_tserver
            && processes.contains(&ServerType::TServer);

        self.set_node_state(nodes, op.node_state());
        self.hook("PreNodeHook", &config.pre_node_hook, nodes);
        if context.run_before_stopping {
            self.change(op, nodes, processes);
        }

        if blacklist_node {
            self.add_group(SubTaskGroup::single(
                "ModifyBlackList",
                SubTaskGroupType::ConfigureUniverse,
                ModifyLeaderBlacklist {
                    universe_id,
                    nodes: vec![node.clone()],
                    add: true,
                    side_effects: Arc::clone(&self.side_effects),
                },
            ));
        }
        let mut stop = SubTaskGroup::new(
            format!("Stopping processes on {}", node.node_name),
            group_type,
        );
        for &process in processes {
            stop.add(ServerControl {
                node: node.clone(),
                process,
                action: ServerAction::Stop,
            });
        }
        if context.reconfigure_master
            && active_role
            && node.is_master
            && processes.contains(&ServerType::Master)
        {
            stop.add(ChangeMasterConfig {
                universe_id,
                node: node.clone(),
                add: false,
            });
        }
        self.add_group(stop);

        if !context.run_before_stopping {
            self.change(op, nodes, processes);
        }

        if active_role {
            for &process in processes {
                if !context.skip_starting_processes {
                    self.add_group(SubTaskGroup::single(
                        format!("Starting {} on {}", process, node.node_name),
                        group_type,
                        ServerControl {
                            node: node.clone(),
                            process,
                            action: ServerAction::Start,
                        },
                    ));
                }
                self.add_group(SubTaskGroup::single(
                    "WaitForServer",
                    group_type,
                    WaitForServer {
                        node: node.clone(),
                        process,
                        timeout: config.server_wait_timeout,
                    },
                ));
                if process == ServerType::TServer && node.is_ysql_server {
                    self.add_group(SubTaskGroup::single(
                        "WaitForServer",
                        group_type,
                        WaitForSqlServer {
                            node: node.clone(),
                            probe_interval: config.sql_probe_interval,
                            timeout: config.sql_probe_timeout,
                        },
                    ));
                }
                if process == ServerType::Master && context.reconfigure_master
                {
                    self.add_group(SubTaskGroup::single(
                        "ChangeMasterConfig",
                        SubTaskGroupType::ConfigureUniverse,
                        ChangeMasterConfig {
                            universe_id,
                            node: node.clone(),
                            add: true,
                        },
                    ));
                }
                self.add_group(SubTaskGroup::single(
                    "WaitForServerReady",
                    group_type,
                    WaitForServerReady {
                        node_name: node.node_name.clone(),
                        process,
                        sleep: self.params.sleep_after_restart(process),
                    },
                ));
            }

            if blacklist_node {
                self.add_group(SubTaskGroup::single(
                    "ModifyBlackList",
                    SubTaskGroupType::ConfigureUniverse,
                    ModifyLeaderBlacklist {
                        universe_id,
                        nodes: vec![node.clone()],
                        add: false,
                        side_effects: Arc::clone(&self.side_effects),
                    },
                ));
            }

            let mut lag = SubTaskGroup::new("WaitForFollowerLag", group_type);
            for &process in processes {
                lag.add(WaitForFollowerLag {
                    universe_id,
                    node: node.clone(),
                    process,
                    threshold: config.follower_lag_threshold,
                    poll_interval: config.follower_lag_poll_interval,
                    max_polls: config.follower_lag_max_polls,
                });
            }
            self.add_group(lag);
        }

        if let Some(post_action) = &context.post_action {
            self.add_group(post_action(node));
        }
        self.hook("PostNodeHook", &config.post_node_hook, nodes);
        self.set_node_state(nodes, NodeState::Live);
    }

    fn non_rolling(
        &mut self,
        op: &dyn UpgradeOperation,
        masters: &[NodeDetails],
        tservers: &[NodeDetails],
        context: &UpgradeContext,
    ) {
        let group_type = op.sub_group_type();
        let master_set = BTreeSet::from([ServerType::Master]);
        let tserver_set = BTreeSet::from([ServerType::TServer]);
        // Inactive masters get the master change and are stopped, but their
        // master process is never started again.
        let inactive = if context.process_inactive_master {
            node_ordering::inactive_masters(
                &self.universe,
                &self.masters,
                &self.tservers,
            )
        } else {
            Vec::new()
        };
        let all = union(&union(masters, &inactive), tservers);

        self.set_node_state(&all, op.node_state());
        if context.run_before_stopping {
            self.change(op, masters, &master_set);
            self.change(op, &inactive, &master_set);
            self.change(op, tservers, &tserver_set);
        }
        self.add_group(server_control_group(
            tservers,
            ServerType::TServer,
            ServerAction::Stop,
            group_type,
        ));
        self.add_group(server_control_group(
            masters,
            ServerType::Master,
            ServerAction::Stop,
            group_type,
        ));
        self.add_group(server_control_group(
            &inactive,
            ServerType::Master,
            ServerAction::Stop,
            group_type,
        ));
        if !context.run_before_stopping {
            self.change(op, masters, &master_set);
            self.change(op, &inactive, &master_set);
            self.change(op, tservers, &tserver_set);
        }

        for (nodes, process) in
            [(masters, ServerType::Master), (tservers, ServerType::TServer)]
        {
            self.add_group(server_control_group(
                nodes,
                process,
                ServerAction::Start,
                group_type,
            ));
            let mut wait = SubTaskGroup::new("WaitForServer", group_type);
            let mut ready =
                SubTaskGroup::new("WaitForServerReady", group_type);
            for node in nodes {
                wait.add(WaitForServer {
                    node: node.clone(),
                    process,
                    timeout: self.config.server_wait_timeout,
                });
                if process == ServerType::TServer && node.is_ysql_server {
                    wait.add(WaitForSqlServer {
                        node: node.clone(),
                        probe_interval: self.config.sql_probe_interval,
                        timeout: self.config.sql_probe_timeout,
                    });
                }
                ready.add(WaitForServerReady {
                    node_name: node.node_name.clone(),
                    process,
                    sleep: self.params.sleep_after_restart(process),
                });
            }
            self.add_group(wait);
            self.add_group(ready);
        }

        self.finish_nodes(&all, context);
    }

    fn non_restart(
        &mut self,
        op: &dyn UpgradeOperation,
        masters: &[NodeDetails],
        tservers: &[NodeDetails],
        context: &UpgradeContext,
    ) {
        let all = union(masters, tservers);
        self.set_node_state(&all, op.node_state());
        self.change(op, masters, &BTreeSet::from([ServerType::Master]));
        self.change(op, tservers, &BTreeSet::from([ServerType::TServer]));
        self.finish_nodes(&all, context);
    }

    fn finish_nodes(&mut self, nodes: &[NodeDetails], context: &UpgradeContext) {
        if let Some(post_action) = &context.post_action {
            for node in nodes {
                self.add_group(post_action(node));
            }
        }
        self.set_node_state(nodes, NodeState::Live);
    }

    fn change(
        &mut self,
        op: &dyn UpgradeOperation,
        nodes: &[NodeDetails],
        processes: &BTreeSet<ServerType>,
    ) {
        if nodes.is_empty() {
            return;
        }
        for mut group in op.build_change(&self.universe, nodes, processes) {
            group.set_group_type(op.sub_group_type());
            self.add_group(group);
        }
    }

    fn set_node_state(&mut self, nodes: &[NodeDetails], state: NodeState) {
        let mut group =
            SubTaskGroup::new("SetNodeState", SubTaskGroupType::ConfigureUniverse);
        for node in nodes {
            group.add(SetNodeState {
                universe_id: self.universe.id,
                node_name: node.node_name.clone(),
                state,
            });
        }
        self.add_group(group);
    }

    /// Queues `hook` (if configured) to run on every one of `nodes`
    fn hook(
        &mut self,
        label: &str,
        hook: &Option<Vec<String>>,
        nodes: &[NodeDetails],
    ) {
        let Some(argv) = hook else {
            return;
        };
        let mut group = SubTaskGroup::new(label, SubTaskGroupType::RunningHooks);
        for node in nodes {
            group.add(RemoteCommand {
                label: label.to_string(),
                node: node.clone(),
                argv: argv.clone(),
            });
        }
        self.add_group(group);
    }

    fn load_balancer_group(&self, enabled: bool) -> SubTaskGroup {
        SubTaskGroup::single(
            "SetLoadBalancerState",
            SubTaskGroupType::ConfigureUniverse,
            SetLoadBalancerState {
                universe_id: self.universe.id,
                enabled,
                side_effects: Arc::clone(&self.side_effects),
            },
        )
    }
}

fn with_processes(
    nodes: &[NodeDetails],
    process: ServerType,
) -> Vec<(NodeDetails, BTreeSet<ServerType>)> {
    nodes.iter().map(|n| (n.clone(), BTreeSet::from([process]))).collect()
}

fn union(masters: &[NodeDetails], tservers: &[NodeDetails]) -> Vec<NodeDetails> {
    let mut nodes = masters.to_vec();
    for node in tservers {
        if !nodes.iter().any(|n| n.node_name == node.node_name) {
            nodes.push(node.clone());
        }
    }
    nodes
}

fn server_control_group(
    nodes: &[NodeDetails],
    process: ServerType,
    action: ServerAction,
    group_type: SubTaskGroupType,
) -> SubTaskGroup {
    let mut group = SubTaskGroup::new(
        format!("AnsibleClusterServerCtl({}, {})", process, action),
        group_type,
    );
    for node in nodes {
        group.add(ServerControl { node: node.clone(), process, action });
    }
    group
}

/// Runs an upgrade of the universe named by `params`
///
/// Locks the universe, lets `build` describe the node flow through an
/// [`UpgradeFlow`], wraps it with the universe-wide hooks and runs the
/// result.  Whatever happens, load-balancer and leader-blacklist changes
/// still in effect are then undone and the universe unlocked.  The version
/// is bumped only if the upgrade succeeded.
pub async fn run_upgrade<F>(
    ctx: &mut TaskContext,
    config: &UpgradeConfig,
    params: &UpgradeTaskParams,
    build: F,
) -> Result<(), Error>
where
    F: FnOnce(&mut UpgradeFlow<'_>) -> Result<(), Error>,
{
    let log = ctx.log().new(o!(
        "universe_id" => params.universe_id.to_string(),
    ));
    let services = ctx.services().clone();
    let universe = lock::lock_for_update(
        &log,
        &*services.metadata,
        params.universe_id,
        params.expected_universe_version,
    )
    .await?;

    let side_effects = Arc::new(SideEffects::default());
    let result = build_and_run(
        &log,
        ctx,
        config,
        params,
        universe,
        &side_effects,
        build,
    )
    .await;
    if let Err(error) = &result {
        warn!(log, "upgrade failed"; "error" => %error);
    }
    undo_side_effects(&log, ctx, params, &side_effects).await;

    match lock::unlock(&log, &*services.metadata, params.universe_id, result.is_ok())
        .await
    {
        Ok(_) => result,
        Err(unlock_error) => {
            error!(log, "failed to unlock universe"; "error" => %unlock_error);
            result.and(Err(unlock_error))
        }
    }
}

async fn build_and_run<F>(
    log: &Logger,
    ctx: &mut TaskContext,
    config: &UpgradeConfig,
    params: &UpgradeTaskParams,
    universe: Universe,
    side_effects: &Arc<SideEffects>,
    build: F,
) -> Result<(), Error>
where
    F: FnOnce(&mut UpgradeFlow<'_>) -> Result<(), Error>,
{
    let option = params.upgrade_option;
    let leader_address = match option {
        UpgradeOption::Rolling => {
            ctx.services().db_admin.master_leader_address(universe.id).await?
        }
        UpgradeOption::NonRolling | UpgradeOption::NonRestart => String::new(),
    };
    let masters = node_ordering::select_masters(
        &universe,
        option,
        &leader_address,
        &params.cluster_ids,
    );
    let tservers = node_ordering::select_tservers(
        log,
        &universe,
        option,
        &params.cluster_ids,
    );
    info!(
        log,
        "planning upgrade";
        "option" => ?option,
        "masters" => masters.len(),
        "tservers" => tservers.len(),
    );

    let universe_id = universe.id;
    let hook_nodes: Vec<_> = universe
        .nodes
        .iter()
        .filter(|n| params.addresses_cluster(n.placement_uuid))
        .cloned()
        .collect();
    let built = {
        let mut flow = UpgradeFlow {
            ctx: &mut *ctx,
            universe,
            params,
            config,
            side_effects: Arc::clone(side_effects),
            masters,
            tservers,
        };
        flow.hook("PreUpgradeHook", &config.pre_upgrade_hook, &hook_nodes);
        let built = build(&mut flow);
        if built.is_ok() {
            flow.hook("PostUpgradeHook", &config.post_upgrade_hook, &hook_nodes);
            flow.add_group(SubTaskGroup::single(
                "MarkUniverseUpdateSuccess",
                SubTaskGroupType::ConfigureUniverse,
                MarkUniverseUpdateSuccess { universe_id },
            ));
        }
        built
    };
    if let Err(error) = built {
        ctx.abort_queued().await;
        return Err(error);
    }
    info!(log, "running upgrade"; "groups" => ctx.queued_groups());
    ctx.run_subtasks().await
}

/// Re-enables the load balancer and clears leader-blacklist entries that a
/// failed upgrade left in place
///
/// Failures are logged and otherwise ignored: the upgrade's own outcome is
/// what gets reported.
async fn undo_side_effects(
    log: &Logger,
    ctx: &mut TaskContext,
    params: &UpgradeTaskParams,
    side_effects: &Arc<SideEffects>,
) {
    let universe_id = params.universe_id;
    let mut group = SubTaskGroup::new(
        "UndoUpgradeSideEffects",
        SubTaskGroupType::ConfigureUniverse,
    );
    if side_effects.load_balancer_disabled() {
        info!(log, "re-enabling load balancer");
        group.add(SetLoadBalancerState {
            universe_id,
            enabled: true,
            side_effects: Arc::clone(side_effects),
        });
    }
    let blacklisted = side_effects.blacklisted_nodes();
    if !blacklisted.is_empty() {
        info!(
            log,
            "removing nodes from leader blacklist";
            "count" => blacklisted.len(),
        );
        group.add(ModifyLeaderBlacklist {
            universe_id,
            nodes: blacklisted,
            add: false,
            side_effects: Arc::clone(side_effects),
        });
    }
    if group.is_empty() {
        return;
    }
    ctx.add_subtask_group(group);
    if let Err(error) = ctx.run_subtasks().await {
        warn!(
            log,
            "failed to undo upgrade side effects";
            "error" => %error,
        );
    }
}
