// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated node agent and helper agent

use crate::external::CommandOutput;
use crate::external::ComponentAgent;
use crate::external::ComponentUpgradeResult;
use crate::external::NodeAgent;
use async_trait::async_trait;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::ServerType;
use fleet_common::Error;
use slog::debug;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// One call made to the simulated node agent
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeEvent {
    Stop { node: String, process: ServerType },
    Start { node: String, process: ServerType },
    Command { node: String, argv: Vec<String> },
}

impl NodeEvent {
    pub fn node(&self) -> &str {
        match self {
            NodeEvent::Stop { node, .. }
            | NodeEvent::Start { node, .. }
            | NodeEvent::Command { node, .. } => node,
        }
    }
}

#[derive(Default)]
struct NodeAgentState {
    stopped: BTreeSet<(String, ServerType)>,
    events: Vec<NodeEvent>,
    failing_starts: BTreeSet<String>,
    /// (node, program) pairs whose commands exit non-zero
    failing_commands: BTreeSet<(String, String)>,
}

/// Node agent whose processes all run until stopped
pub struct SimNodeAgent {
    log: Logger,
    state: Mutex<NodeAgentState>,
}

impl SimNodeAgent {
    pub fn new(log: &Logger) -> SimNodeAgent {
        SimNodeAgent { log: log.clone(), state: Mutex::new(Default::default()) }
    }

    /// Makes every process start on `node` fail
    pub fn fail_start(&self, node: &str) {
        self.state.lock().unwrap().failing_starts.insert(node.to_string());
    }

    /// Makes commands running `program` on `node` exit non-zero
    pub fn fail_command(&self, node: &str, program: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_commands
            .insert((node.to_string(), program.to_string()));
    }

    pub fn is_running(&self, node: &str, process: ServerType) -> bool {
        !self
            .state
            .lock()
            .unwrap()
            .stopped
            .contains(&(node.to_string(), process))
    }

    /// Returns how many times `process` was started on `node`.
    pub fn starts(&self, node: &str, process: ServerType) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| {
                matches!(e, NodeEvent::Start { node: n, process: p }
                    if n == node && *p == process)
            })
            .count()
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Names of the nodes processes were stopped on, in order, without
    /// repeating a node for consecutive stops
    pub fn stop_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for event in self.events() {
            if let NodeEvent::Stop { node, .. } = event {
                if order.last() != Some(&node) {
                    order.push(node);
                }
            }
        }
        order
    }

    /// Commands run on `node`, as argv
    pub fn commands(&self, node: &str) -> Vec<Vec<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                NodeEvent::Command { node: n, argv } if n == node => Some(argv),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: NodeEvent) {
        debug!(self.log, "node agent call"; "event" => ?event);
        self.state.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl NodeAgent for SimNodeAgent {
    async fn stop_process(
        &self,
        node: &NodeDetails,
        process: ServerType,
    ) -> Result<(), Error> {
        self.record(NodeEvent::Stop { node: node.node_name.clone(), process });
        self.state
            .lock()
            .unwrap()
            .stopped
            .insert((node.node_name.clone(), process));
        Ok(())
    }

    async fn start_process(
        &self,
        node: &NodeDetails,
        process: ServerType,
    ) -> Result<(), Error> {
        self.record(NodeEvent::Start { node: node.node_name.clone(), process });
        let mut state = self.state.lock().unwrap();
        if state.failing_starts.contains(&node.node_name) {
            return Err(Error::remote_command_failed(
                &node.node_name,
                &format!("{} failed to start", process),
            ));
        }
        state.stopped.remove(&(node.node_name.clone(), process));
        Ok(())
    }

    async fn wait_for_rpc(
        &self,
        node: &NodeDetails,
        process: ServerType,
        _timeout: Duration,
    ) -> Result<bool, Error> {
        Ok(self.is_running(&node.node_name, process))
    }

    async fn run_remote_command(
        &self,
        node: &NodeDetails,
        argv: &[String],
    ) -> Result<CommandOutput, Error> {
        self.record(NodeEvent::Command {
            node: node.node_name.clone(),
            argv: argv.to_vec(),
        });
        let program = argv.first().cloned().unwrap_or_default();
        let failing = self
            .state
            .lock()
            .unwrap()
            .failing_commands
            .contains(&(node.node_name.clone(), program.clone()));
        let ok = !failing
            && (program != "ysqlsh"
                || self.is_running(&node.node_name, ServerType::TServer));
        Ok(if ok {
            CommandOutput { exit_code: 0, output: String::new() }
        } else {
            CommandOutput {
                exit_code: 1,
                output: format!("{}: command failed", program),
            }
        })
    }
}

#[derive(Default)]
struct ComponentAgentState {
    unreachable: BTreeSet<String>,
    /// nodes on which upgrading from the shared package location fails
    failing_shared: BTreeSet<String>,
    /// pending upgrade request per node: (version, location)
    requests: BTreeMap<String, (String, String)>,
    installed: BTreeMap<String, String>,
    staged: Vec<String>,
}

/// Helper agent that completes every upgrade it is asked for
pub struct SimComponentAgent {
    log: Logger,
    state: Mutex<ComponentAgentState>,
}

const LOCAL_PACKAGE_PREFIX: &str = "file:///opt/staged";

impl SimComponentAgent {
    pub fn new(log: &Logger) -> SimComponentAgent {
        SimComponentAgent {
            log: log.clone(),
            state: Mutex::new(Default::default()),
        }
    }

    pub fn set_unreachable(&self, node: &str) {
        self.state.lock().unwrap().unreachable.insert(node.to_string());
    }

    /// Makes upgrades of `node` from the shared package location fail
    pub fn fail_shared_package(&self, node: &str) {
        self.state.lock().unwrap().failing_shared.insert(node.to_string());
    }

    pub fn installed_version(&self, node: &str) -> Option<String> {
        self.state.lock().unwrap().installed.get(node).cloned()
    }

    /// Nodes a package was staged on, in order
    pub fn staged(&self) -> Vec<String> {
        self.state.lock().unwrap().staged.clone()
    }
}

#[async_trait]
impl ComponentAgent for SimComponentAgent {
    async fn probe(
        &self,
        node: &NodeDetails,
        _timeout: Duration,
    ) -> Result<bool, Error> {
        Ok(!self.state.lock().unwrap().unreachable.contains(&node.node_name))
    }

    async fn request_upgrade(
        &self,
        node: &NodeDetails,
        version: &str,
        location: &str,
    ) -> Result<(), Error> {
        debug!(
            self.log,
            "component upgrade requested";
            "node" => &node.node_name,
            "version" => version,
            "location" => location,
        );
        self.state.lock().unwrap().requests.insert(
            node.node_name.clone(),
            (version.to_string(), location.to_string()),
        );
        Ok(())
    }

    async fn upgrade_result(
        &self,
        node: &NodeDetails,
        version: &str,
    ) -> Result<ComponentUpgradeResult, Error> {
        let mut state = self.state.lock().unwrap();
        let Some((requested, location)) =
            state.requests.get(&node.node_name).cloned()
        else {
            return Err(Error::invalid_request(&format!(
                "no upgrade requested on {}",
                node.node_name
            )));
        };
        if requested != version {
            return Ok(ComponentUpgradeResult::InProgress);
        }
        if !location.starts_with(LOCAL_PACKAGE_PREFIX)
            && state.failing_shared.contains(&node.node_name)
        {
            return Ok(ComponentUpgradeResult::Failed);
        }
        state.installed.insert(node.node_name.clone(), requested);
        Ok(ComponentUpgradeResult::Complete)
    }

    async fn stage_local_package(
        &self,
        node: &NodeDetails,
        version: &str,
    ) -> Result<String, Error> {
        self.state.lock().unwrap().staged.push(node.node_name.clone());
        Ok(format!("{}/{}", LOCAL_PACKAGE_PREFIX, version))
    }
}
