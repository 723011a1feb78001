// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model for universes (managed database clusters) and their nodes

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A deployed database cluster managed by the control plane
///
/// A universe is the only shared mutable resource in the control plane.  All
/// writers must hold the universe lock (see `fleet_orchestrator::lock`), which
/// is represented here by `version` and `update_in_progress`.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Universe {
    pub id: Uuid,
    pub name: String,
    /// Increases by exactly one for every successful mutation.
    pub version: u64,
    /// Set while a mutation owns the universe.
    pub update_in_progress: bool,
    /// Whether the last mutation that ran against this universe succeeded.
    pub update_succeeded: bool,
    pub paused: bool,
    pub clusters: Vec<Cluster>,
    pub nodes: Vec<NodeDetails>,
    /// Version of the in-cluster helper agent installed on every node.
    pub component_version: Option<String>,
    /// Whether this universe runs the in-cluster helper agent at all.
    pub component_enabled: bool,
}

impl Universe {
    pub fn primary_cluster(&self) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.cluster_type == ClusterType::Primary)
    }

    pub fn cluster(&self, id: Uuid) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn cluster_mut(&mut self, id: Uuid) -> Option<&mut Cluster> {
        self.clusters.iter_mut().find(|c| c.id == id)
    }

    pub fn node(&self, node_name: &str) -> Option<&NodeDetails> {
        self.nodes.iter().find(|n| n.node_name == node_name)
    }

    pub fn node_mut(&mut self, node_name: &str) -> Option<&mut NodeDetails> {
        self.nodes.iter_mut().find(|n| n.node_name == node_name)
    }

    /// Nodes running the master role, in stored order
    pub fn masters(&self) -> Vec<NodeDetails> {
        self.nodes.iter().filter(|n| n.is_master).cloned().collect()
    }

    /// Nodes running the tserver role, in stored order
    pub fn tservers(&self) -> Vec<NodeDetails> {
        self.nodes.iter().filter(|n| n.is_tserver).cloned().collect()
    }

    /// Whether any cluster of this universe is deployed on Kubernetes
    pub fn is_kubernetes(&self) -> bool {
        self.primary_cluster().map_or(false, |c| {
            c.user_intent.provider_type == CloudType::Kubernetes
        })
    }
}

/// One placement group (primary or read replica) within a universe
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Cluster {
    pub id: Uuid,
    pub cluster_type: ClusterType,
    pub user_intent: UserIntent,
    /// Availability zones the cluster is placed in, keyed by zone id.
    pub placement: BTreeMap<Uuid, PlacementAz>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    Primary,
    ReadReplica,
}

/// Placement metadata for one availability zone of a cluster
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PlacementAz {
    pub name: String,
    pub num_nodes: u32,
    /// Whether leaders should preferentially live in this zone
    pub is_affinitized: bool,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CloudType {
    Aws,
    Gcp,
    Azure,
    OnPrem,
    Kubernetes,
}

/// Operator-requested configuration of a cluster
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct UserIntent {
    pub provider_type: CloudType,
    pub software_version: String,
    pub replication_factor: u32,
    pub instance_type: String,
    pub master_gflags: BTreeMap<String, String>,
    pub tserver_gflags: BTreeMap<String, String>,
    pub enable_node_to_node_encrypt: bool,
    pub enable_client_to_node_encrypt: bool,
    pub root_ca: Option<Uuid>,
    pub client_root_ca: Option<Uuid>,
}

/// One member of a universe
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct NodeDetails {
    /// unique within the universe
    pub node_name: String,
    pub node_idx: u32,
    /// cluster this node belongs to
    pub placement_uuid: Uuid,
    /// availability zone this node is placed in
    pub az_uuid: Uuid,
    pub state: NodeState,
    pub is_master: bool,
    pub is_tserver: bool,
    pub is_ysql_server: bool,
    pub private_ip: String,
}

impl NodeDetails {
    /// Every server process hosted on this node
    pub fn all_processes(&self) -> Vec<ServerType> {
        let mut processes = Vec::new();
        if self.is_master {
            processes.push(ServerType::Master);
        }
        if self.is_tserver {
            processes.push(ServerType::TServer);
        }
        processes
    }
}

impl fmt::Display for NodeDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_name, self.private_ip)
    }
}

/// Lifecycle state of a node
///
/// Nodes move through the provisioning states once; afterwards every mutation
/// moves them from `Live` through an operation-specific state and back to
/// `Live`.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
pub enum NodeState {
    ToBeAdded,
    Adding,
    InstanceCreated,
    Provisioned,
    SoftwareInstalled,
    UpgradeSoftware,
    UpdateGFlags,
    UpdateCert,
    Resizing,
    Rebooting,
    Stopping,
    Starting,
    Live,
    Stopped,
    Removed,
    Decommissioned,
}

/// A server process role hosted on a node
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum ServerType {
    Master,
    TServer,
    /// the SQL endpoint served by a tserver
    YsqlServer,
    /// the in-cluster helper agent
    Controller,
}
