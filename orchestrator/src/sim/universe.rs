// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction of universe records for simulation and tests

use fleet_common::universe::CloudType;
use fleet_common::universe::Cluster;
use fleet_common::universe::ClusterType;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::NodeState;
use fleet_common::universe::PlacementAz;
use fleet_common::universe::Universe;
use fleet_common::universe::UserIntent;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const SIM_SOFTWARE_VERSION: &str = "2.18.0.0-b1";
pub const SIM_INSTANCE_TYPE: &str = "c5.large";

#[derive(Clone, Copy)]
enum NodeKind {
    MasterAndTServer,
    TServerOnly,
    ReadReplica,
}

/// Builds a [`Universe`] whose nodes are all `Live`
///
/// Nodes are named `<name>-n<idx>` with `idx` counting from 1 in the order
/// they were added, and node `idx` has private address `10.0.0.<idx>`.  Every
/// node gets an availability zone of its own.  Read replicas live in a
/// second cluster.
pub struct UniverseBuilder {
    name: String,
    nodes: Vec<NodeKind>,
    affinitized: BTreeSet<usize>,
    provider_type: CloudType,
    component_version: Option<String>,
    component_enabled: bool,
}

impl UniverseBuilder {
    pub fn new(name: &str) -> UniverseBuilder {
        UniverseBuilder {
            name: name.to_string(),
            nodes: Vec::new(),
            affinitized: BTreeSet::new(),
            provider_type: CloudType::Aws,
            component_version: None,
            component_enabled: false,
        }
    }

    /// Adds `count` primary-cluster nodes that run both a master and a
    /// tserver
    pub fn masters_and_tservers(self, count: usize) -> Self {
        self.add(NodeKind::MasterAndTServer, count)
    }

    /// Adds `count` primary-cluster nodes that run only a tserver
    pub fn tservers_only(self, count: usize) -> Self {
        self.add(NodeKind::TServerOnly, count)
    }

    /// Adds `count` read-replica nodes
    pub fn read_replicas(self, count: usize) -> Self {
        self.add(NodeKind::ReadReplica, count)
    }

    /// Marks the zone of the node at position `index` (counting from 0) as
    /// preferred for leaders
    pub fn affinitize_node(mut self, index: usize) -> Self {
        self.affinitized.insert(index);
        self
    }

    pub fn provider(mut self, provider_type: CloudType) -> Self {
        self.provider_type = provider_type;
        self
    }

    /// Runs the helper agent on the universe, currently at `version`
    pub fn component(mut self, version: Option<&str>) -> Self {
        self.component_enabled = true;
        self.component_version = version.map(str::to_string);
        self
    }

    fn add(mut self, kind: NodeKind, count: usize) -> Self {
        self.nodes.extend(std::iter::repeat(kind).take(count));
        self
    }

    pub fn build(self) -> Universe {
        let intent = UserIntent {
            provider_type: self.provider_type,
            software_version: SIM_SOFTWARE_VERSION.to_string(),
            replication_factor: 3,
            instance_type: SIM_INSTANCE_TYPE.to_string(),
            master_gflags: BTreeMap::new(),
            tserver_gflags: BTreeMap::new(),
            enable_node_to_node_encrypt: true,
            enable_client_to_node_encrypt: true,
            root_ca: Some(Uuid::new_v4()),
            client_root_ca: None,
        };
        let mut primary = Cluster {
            id: Uuid::new_v4(),
            cluster_type: ClusterType::Primary,
            user_intent: intent.clone(),
            placement: BTreeMap::new(),
        };
        let mut replica = Cluster {
            id: Uuid::new_v4(),
            cluster_type: ClusterType::ReadReplica,
            user_intent: UserIntent { replication_factor: 1, ..intent },
            placement: BTreeMap::new(),
        };

        let mut nodes = Vec::new();
        for (index, kind) in self.nodes.iter().enumerate() {
            let idx = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let az_uuid = Uuid::new_v4();
            let cluster = match kind {
                NodeKind::ReadReplica => &mut replica,
                _ => &mut primary,
            };
            cluster.placement.insert(
                az_uuid,
                PlacementAz {
                    name: format!("az-{}", idx),
                    num_nodes: 1,
                    is_affinitized: self.affinitized.contains(&index),
                },
            );
            let is_master = matches!(kind, NodeKind::MasterAndTServer);
            nodes.push(NodeDetails {
                node_name: format!("{}-n{}", self.name, idx),
                node_idx: idx,
                placement_uuid: cluster.id,
                az_uuid,
                state: NodeState::Live,
                is_master,
                is_tserver: true,
                is_ysql_server: true,
                private_ip: format!("10.0.0.{}", idx),
            });
        }

        let mut clusters = vec![primary];
        if !replica.placement.is_empty() {
            clusters.push(replica);
        }
        Universe {
            id: Uuid::new_v4(),
            name: self.name,
            version: 0,
            update_in_progress: false,
            update_succeeded: true,
            paused: false,
            clusters,
            nodes,
            component_version: self.component_version,
            component_enabled: self.component_enabled,
        }
    }
}
