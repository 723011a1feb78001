// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Selection and ordering of the nodes a mutation touches
//!
//! Everything here is a pure function of a universe snapshot.  Orderings are
//! total (ties are always broken by node index), so the same snapshot always
//! produces the same sequence of subtasks.

use crate::upgrade::UpgradeOption;
use fleet_common::universe::ClusterType;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::NodeState;
use fleet_common::universe::Universe;
use slog::warn;
use slog::Logger;
use uuid::Uuid;

/// Returns whether `node` belongs to one of `cluster_ids` (an empty list
/// addresses every cluster).
fn in_clusters(node: &NodeDetails, cluster_ids: &[Uuid]) -> bool {
    cluster_ids.is_empty() || cluster_ids.contains(&node.placement_uuid)
}

/// Returns the master nodes of the addressed clusters, in restart order for
/// rolling upgrades and in stored order otherwise
pub fn select_masters(
    universe: &Universe,
    option: UpgradeOption,
    leader_address: &str,
    cluster_ids: &[Uuid],
) -> Vec<NodeDetails> {
    let masters: Vec<_> = universe
        .masters()
        .into_iter()
        .filter(|n| in_clusters(n, cluster_ids))
        .collect();
    match option {
        UpgradeOption::Rolling => sort_masters_for_restart(leader_address, masters),
        UpgradeOption::NonRolling | UpgradeOption::NonRestart => masters,
    }
}

/// Returns the tserver nodes of the addressed clusters, in restart order for
/// rolling upgrades and in stored order otherwise
pub fn select_tservers(
    log: &Logger,
    universe: &Universe,
    option: UpgradeOption,
    cluster_ids: &[Uuid],
) -> Vec<NodeDetails> {
    let tservers: Vec<_> = universe
        .tservers()
        .into_iter()
        .filter(|n| in_clusters(n, cluster_ids))
        .collect();
    match option {
        UpgradeOption::Rolling => {
            sort_tservers_for_restart(log, universe, tservers)
        }
        UpgradeOption::NonRolling | UpgradeOption::NonRestart => tservers,
    }
}

/// Orders masters so that the current leader restarts last
///
/// Sort key: nodes that are not `Live` first, then non-leaders before the
/// leader, then node index.
pub fn sort_masters_for_restart(
    leader_address: &str,
    mut nodes: Vec<NodeDetails>,
) -> Vec<NodeDetails> {
    nodes.sort_by_key(|node| {
        (
            node.state == NodeState::Live,
            node.private_ip == leader_address,
            node.node_idx,
        )
    });
    nodes
}

/// Orders tservers for a rolling restart
///
/// Sort key: primary-cluster nodes before read replicas, nodes that are not
/// `Live` first, nodes in a leader-affinitized zone first, then node index.
/// A node whose zone has no placement metadata sorts after those that do.
pub fn sort_tservers_for_restart(
    log: &Logger,
    universe: &Universe,
    mut nodes: Vec<NodeDetails>,
) -> Vec<NodeDetails> {
    let primary_id = universe.primary_cluster().map(|c| c.id);
    nodes.sort_by_cached_key(|node| {
        let not_affinitized = match universe.cluster(node.placement_uuid) {
            None => {
                warn!(
                    log,
                    "no placement for cluster of node";
                    "node" => &node.node_name,
                    "cluster_id" => %node.placement_uuid,
                );
                true
            }
            Some(cluster) => cluster
                .placement
                .get(&node.az_uuid)
                .map_or(true, |az| !az.is_affinitized),
        };
        (
            Some(node.placement_uuid) != primary_id,
            node.state == NodeState::Live,
            not_affinitized,
            node.node_idx,
        )
    });
    nodes
}

/// Returns the tservers of the primary cluster that do not run a master
///
/// These nodes host a master process that is not part of the quorum, which
/// some changes must still reach.
pub fn inactive_masters(
    universe: &Universe,
    masters: &[NodeDetails],
    tservers: &[NodeDetails],
) -> Vec<NodeDetails> {
    let Some(primary) = universe
        .clusters
        .iter()
        .find(|c| c.cluster_type == ClusterType::Primary)
    else {
        return Vec::new();
    };
    tservers
        .iter()
        .filter(|n| n.placement_uuid == primary.id)
        .filter(|n| !masters.iter().any(|m| m.node_name == n.node_name))
        .cloned()
        .collect()
}
