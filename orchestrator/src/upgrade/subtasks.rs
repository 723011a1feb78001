// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subtasks emitted by the upgrade state machine

use super::SideEffects;
use crate::executor::SubTask;
use crate::executor::SubTaskContext;
use crate::lock;
use async_trait::async_trait;
use fleet_common::poll;
use fleet_common::poll::wait_for_condition;
use fleet_common::poll::wait_for_condition_attempts;
use fleet_common::poll::CondCheckError;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::NodeState;
use fleet_common::universe::ServerType;
use fleet_common::universe::Universe;
use fleet_common::Error;
use fleet_common::InternalContext;
use slog::debug;
use slog::info;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Records a new state for one node
pub struct SetNodeState {
    pub universe_id: Uuid,
    pub node_name: String,
    pub state: NodeState,
}

#[async_trait]
impl SubTask for SetNodeState {
    fn name(&self) -> String {
        format!("SetNodeState({}, {})", self.node_name, self.state)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let node_name = self.node_name.clone();
        let state = self.state;
        lock::update_locked(
            &*ctx.services.metadata,
            self.universe_id,
            move |universe| {
                let node = universe.node_mut(&node_name).ok_or_else(|| {
                    Error::internal_error(&format!(
                        "node {} not in universe",
                        node_name
                    ))
                })?;
                node.state = state;
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServerAction {
    Start,
    Stop,
}

/// Starts or stops one process on one node
pub struct ServerControl {
    pub node: NodeDetails,
    pub process: ServerType,
    pub action: ServerAction,
}

#[async_trait]
impl SubTask for ServerControl {
    fn name(&self) -> String {
        format!(
            "ServerControl({}, {}, {})",
            self.node.node_name, self.process, self.action
        )
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let agent = &ctx.services.node_agent;
        match self.action {
            ServerAction::Start => {
                agent.start_process(&self.node, self.process).await
            }
            ServerAction::Stop => {
                agent.stop_process(&self.node, self.process).await
            }
        }
        .with_internal_context(|| {
            format!("{} {}", self.action, self.process)
        })
    }
}

/// Waits for a process to accept RPCs
pub struct WaitForServer {
    pub node: NodeDetails,
    pub process: ServerType,
    pub timeout: Duration,
}

#[async_trait]
impl SubTask for WaitForServer {
    fn name(&self) -> String {
        format!("WaitForServer({}, {})", self.node.node_name, self.process)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let ready = ctx
            .services
            .node_agent
            .wait_for_rpc(&self.node, self.process, self.timeout)
            .await?;
        if !ready {
            return Err(Error::timeout(
                &format!("{} on {} to accept RPCs", self.process, self.node),
                self.timeout,
            ));
        }
        Ok(())
    }
}

/// Waits for the SQL endpoint of a node to answer a trivial query
pub struct WaitForSqlServer {
    pub node: NodeDetails,
    pub probe_interval: Duration,
    pub timeout: Duration,
}

impl WaitForSqlServer {
    fn probe_command(&self) -> Vec<String> {
        vec![
            "ysqlsh".to_string(),
            "-h".to_string(),
            self.node.private_ip.clone(),
            "-c".to_string(),
            "SELECT version();".to_string(),
        ]
    }
}

#[async_trait]
impl SubTask for WaitForSqlServer {
    fn name(&self) -> String {
        format!("WaitForServer({}, {})", self.node.node_name, ServerType::YsqlServer)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let argv = self.probe_command();
        let agent = &ctx.services.node_agent;
        let result = wait_for_condition(
            || async {
                match agent.run_remote_command(&self.node, &argv).await {
                    Ok(output) if output.success() => Ok(()),
                    Ok(output) => {
                        debug!(
                            ctx.log,
                            "sql probe failed";
                            "exit_code" => output.exit_code,
                        );
                        Err(CondCheckError::<Error>::NotYet)
                    }
                    Err(error) => {
                        debug!(ctx.log, "sql probe failed"; "error" => %error);
                        Err(CondCheckError::NotYet)
                    }
                }
            },
            &self.probe_interval,
            &self.timeout,
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(poll::Error::PermanentError(error)) => Err(error),
            Err(error) => Err(Error::timeout(
                &format!("sql endpoint on {}", self.node),
                error.elapsed().unwrap_or(self.timeout),
            )),
        }
    }
}

/// Adds a node to, or removes it from, the master quorum
///
/// Nothing is done if the quorum already has the desired membership.
pub struct ChangeMasterConfig {
    pub universe_id: Uuid,
    pub node: NodeDetails,
    pub add: bool,
}

#[async_trait]
impl SubTask for ChangeMasterConfig {
    fn name(&self) -> String {
        let op = if self.add { "add" } else { "remove" };
        format!("ChangeMasterConfig({}, {})", self.node.node_name, op)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let admin = &ctx.services.db_admin;
        let addresses = admin.master_addresses(self.universe_id).await?;
        let present = addresses.contains(&self.node.private_ip);
        if present == self.add {
            info!(
                ctx.log,
                "master quorum already has the requested membership";
                "node" => &self.node.node_name,
                "add" => self.add,
            );
            return Ok(());
        }
        admin.change_master_config(self.universe_id, &self.node, self.add).await
    }
}

/// Adds nodes to, or removes them from, the leader blacklist
pub struct ModifyLeaderBlacklist {
    pub universe_id: Uuid,
    pub nodes: Vec<NodeDetails>,
    pub add: bool,
    pub side_effects: Arc<SideEffects>,
}

#[async_trait]
impl SubTask for ModifyLeaderBlacklist {
    fn name(&self) -> String {
        let op = if self.add { "add" } else { "remove" };
        let names: Vec<_> =
            self.nodes.iter().map(|n| n.node_name.as_str()).collect();
        format!("ModifyLeaderBlacklist({}, [{}])", op, names.join(", "))
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        ctx.services
            .load_balancer
            .set_leader_blacklist(self.universe_id, &self.nodes, self.add)
            .await?;
        if self.add {
            self.side_effects.record_blacklisted(&self.nodes);
        } else {
            self.side_effects.record_unblacklisted(&self.nodes);
        }
        Ok(())
    }
}

/// Enables or disables the universe's load balancer
pub struct SetLoadBalancerState {
    pub universe_id: Uuid,
    pub enabled: bool,
    pub side_effects: Arc<SideEffects>,
}

#[async_trait]
impl SubTask for SetLoadBalancerState {
    fn name(&self) -> String {
        format!("SetLoadBalancerState({})", self.enabled)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        // Record the intent to disable before doing it, so that a failure
        // partway through still gets compensated.
        if !self.enabled {
            self.side_effects.set_load_balancer_disabled(true);
        }
        ctx.services
            .load_balancer
            .set_enabled(self.universe_id, self.enabled)
            .await?;
        if self.enabled {
            self.side_effects.set_load_balancer_disabled(false);
        }
        Ok(())
    }
}

/// Gives a restarted process time to settle
pub struct WaitForServerReady {
    pub node_name: String,
    pub process: ServerType,
    pub sleep: Duration,
}

#[async_trait]
impl SubTask for WaitForServerReady {
    fn name(&self) -> String {
        format!("WaitForServerReady({}, {})", self.node_name, self.process)
    }

    async fn run(&self, _ctx: &SubTaskContext) -> Result<(), Error> {
        tokio::time::sleep(self.sleep).await;
        Ok(())
    }
}

/// Waits for a node's replicas to catch up with their leaders
pub struct WaitForFollowerLag {
    pub universe_id: Uuid,
    pub node: NodeDetails,
    pub process: ServerType,
    pub threshold: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

#[async_trait]
impl SubTask for WaitForFollowerLag {
    fn name(&self) -> String {
        format!("WaitForFollowerLag({}, {})", self.node.node_name, self.process)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let admin = &ctx.services.db_admin;
        let threshold_ms = u64::try_from(self.threshold.as_millis())
            .unwrap_or(u64::MAX);
        let result = wait_for_condition_attempts(
            || async {
                let lag_ms = admin
                    .follower_lag_ms(self.universe_id, &self.node, self.process)
                    .await
                    .map_err(CondCheckError::Failed)?;
                if lag_ms < threshold_ms {
                    Ok(())
                } else {
                    debug!(ctx.log, "follower lag above threshold"; "lag_ms" => lag_ms);
                    Err(CondCheckError::NotYet)
                }
            },
            &self.poll_interval,
            self.max_polls,
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(poll::Error::PermanentError(error)) => Err(error),
            Err(error) => Err(Error::timeout(
                &format!(
                    "follower lag of {} on {} to drop below {:?}",
                    self.process, self.node, self.threshold
                ),
                error.elapsed().unwrap_or_default(),
            )),
        }
    }
}

/// Runs a command on a node, failing unless it exits successfully
///
/// Node-local changes (installing software, writing flag files, rotating
/// certificates) and operator hooks are all expressed this way.
pub struct RemoteCommand {
    pub label: String,
    pub node: NodeDetails,
    pub argv: Vec<String>,
}

#[async_trait]
impl SubTask for RemoteCommand {
    fn name(&self) -> String {
        format!("{}({})", self.label, self.node.node_name)
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        debug!(ctx.log, "running command"; "argv" => ?self.argv);
        let output = ctx
            .services
            .node_agent
            .run_remote_command(&self.node, &self.argv)
            .await?;
        if !output.success() {
            return Err(Error::remote_command_failed(
                &self.node.node_name,
                &format!(
                    "{:?} exited with status {}: {}",
                    self.argv, output.exit_code, output.output
                ),
            ));
        }
        Ok(())
    }
}

/// Writes a change to the universe record while the universe is locked
pub struct UpdateUniverse {
    pub label: String,
    pub universe_id: Uuid,
    pub mutator: Arc<dyn Fn(&mut Universe) -> Result<(), Error> + Send + Sync>,
}

#[async_trait]
impl SubTask for UpdateUniverse {
    fn name(&self) -> String {
        self.label.clone()
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        let mutator = Arc::clone(&self.mutator);
        lock::update_locked(
            &*ctx.services.metadata,
            self.universe_id,
            move |universe| mutator(universe),
        )
        .await?;
        Ok(())
    }
}

/// Records that every step of the mutation before it succeeded
pub struct MarkUniverseUpdateSuccess {
    pub universe_id: Uuid,
}

#[async_trait]
impl SubTask for MarkUniverseUpdateSuccess {
    fn name(&self) -> String {
        "MarkUniverseUpdateSuccess".to_string()
    }

    async fn run(&self, ctx: &SubTaskContext) -> Result<(), Error> {
        lock::update_locked(
            &*ctx.services.metadata,
            self.universe_id,
            |universe| {
                universe.update_succeeded = true;
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}
