// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated universe records, load balancer and database admin RPCs

use crate::external::ClusterMetadataStore;
use crate::external::DatabaseAdmin;
use crate::external::LoadBalancerControl;
use crate::external::UniverseMutator;
use crate::sim::SimNodeAgent;
use async_trait::async_trait;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::ServerType;
use fleet_common::universe::Universe;
use fleet_common::Error;
use fleet_common::ResourceType;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory universe records with compare-and-swap updates
pub struct SimMetadataStore {
    universes: Mutex<BTreeMap<Uuid, Universe>>,
}

impl SimMetadataStore {
    pub fn new(universes: Vec<Universe>) -> SimMetadataStore {
        SimMetadataStore {
            universes: Mutex::new(
                universes.into_iter().map(|u| (u.id, u)).collect(),
            ),
        }
    }

    pub fn insert(&self, universe: Universe) {
        self.universes.lock().unwrap().insert(universe.id, universe);
    }

    pub fn remove(&self, id: Uuid) -> Option<Universe> {
        self.universes.lock().unwrap().remove(&id)
    }

    /// Returns the current record, for inspection by tests
    pub fn get(&self, id: Uuid) -> Option<Universe> {
        self.universes.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl ClusterMetadataStore for SimMetadataStore {
    async fn load_universe(&self, id: Uuid) -> Result<Universe, Error> {
        self.get(id)
            .ok_or_else(|| Error::not_found_by_id(ResourceType::Universe, &id))
    }

    async fn cas_update_universe(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        mutator: UniverseMutator,
    ) -> Result<Universe, Error> {
        let mut universes = self.universes.lock().unwrap();
        let stored = universes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found_by_id(ResourceType::Universe, &id))?;
        if let Some(expected) = expected_version {
            if stored.version != expected {
                return Err(Error::concurrent_modification(
                    id,
                    &format!(
                        "expected version {}, found {}",
                        expected, stored.version
                    ),
                ));
            }
        }
        // Mutate a copy so that a failing mutator leaves the record alone.
        let mut updated = stored.clone();
        mutator(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_universes(&self) -> Result<Vec<Universe>, Error> {
        Ok(self.universes.lock().unwrap().values().cloned().collect())
    }
}

/// One call made to the simulated load balancer
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadBalancerEvent {
    SetEnabled(bool),
    Blacklist { nodes: Vec<String>, add: bool },
}

#[derive(Default)]
struct LoadBalancerState {
    disabled: BTreeSet<Uuid>,
    /// universes for which re-enabling the load balancer fails
    failing_enable: BTreeSet<Uuid>,
    blacklists: BTreeMap<Uuid, BTreeSet<String>>,
    events: BTreeMap<Uuid, Vec<LoadBalancerEvent>>,
}

/// Load balancer that is enabled for every universe until told otherwise
#[derive(Default)]
pub struct SimLoadBalancer {
    state: Mutex<LoadBalancerState>,
}

impl SimLoadBalancer {
    pub fn new() -> SimLoadBalancer {
        SimLoadBalancer::default()
    }

    /// Makes every request to re-enable the load balancer of `universe_id`
    /// fail
    pub fn fail_enable(&self, universe_id: Uuid) {
        self.state.lock().unwrap().failing_enable.insert(universe_id);
    }

    pub fn is_enabled(&self, universe_id: Uuid) -> bool {
        !self.state.lock().unwrap().disabled.contains(&universe_id)
    }

    /// Names of the nodes on the universe's leader blacklist
    pub fn blacklist(&self, universe_id: Uuid) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .blacklists
            .get(&universe_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn events(&self, universe_id: Uuid) -> Vec<LoadBalancerEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .get(&universe_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LoadBalancerControl for SimLoadBalancer {
    async fn set_enabled(
        &self,
        universe_id: Uuid,
        enabled: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if enabled && state.failing_enable.contains(&universe_id) {
            return Err(Error::internal_error(
                "load balancer rejected the request",
            ));
        }
        if enabled {
            state.disabled.remove(&universe_id);
        } else {
            state.disabled.insert(universe_id);
        }
        state
            .events
            .entry(universe_id)
            .or_default()
            .push(LoadBalancerEvent::SetEnabled(enabled));
        Ok(())
    }

    async fn set_leader_blacklist(
        &self,
        universe_id: Uuid,
        nodes: &[NodeDetails],
        add: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.node_name.clone()).collect();
        let blacklist = state.blacklists.entry(universe_id).or_default();
        for name in &names {
            if add {
                blacklist.insert(name.clone());
            } else {
                blacklist.remove(name);
            }
        }
        state
            .events
            .entry(universe_id)
            .or_default()
            .push(LoadBalancerEvent::Blacklist { nodes: names, add });
        Ok(())
    }
}

/// One change of a universe's master quorum
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasterConfigChange {
    pub node: String,
    pub add: bool,
    /// how many times the node's master had been started when the change
    /// was made
    pub master_starts: usize,
}

#[derive(Default)]
struct DatabaseAdminState {
    /// master quorum per universe, seeded from the universe record on first
    /// use
    quorums: BTreeMap<Uuid, BTreeSet<String>>,
    leaders: BTreeMap<Uuid, String>,
    follower_lag_ms: u64,
    changes: BTreeMap<Uuid, Vec<MasterConfigChange>>,
}

/// Database RPCs answered from the universe records
///
/// Unless set with [`SimDatabaseAdmin::set_leader`], the leader is the first
/// master of the universe.
///
/// A master can only be added to the quorum while it is running.
pub struct SimDatabaseAdmin {
    metadata: Arc<SimMetadataStore>,
    node_agent: Arc<SimNodeAgent>,
    state: Mutex<DatabaseAdminState>,
}

impl SimDatabaseAdmin {
    pub fn new(
        metadata: Arc<SimMetadataStore>,
        node_agent: Arc<SimNodeAgent>,
    ) -> SimDatabaseAdmin {
        SimDatabaseAdmin {
            metadata,
            node_agent,
            state: Mutex::new(Default::default()),
        }
    }

    /// Changes made to the master quorum of `universe_id`, in order
    pub fn master_config_changes(
        &self,
        universe_id: Uuid,
    ) -> Vec<MasterConfigChange> {
        self.state
            .lock()
            .unwrap()
            .changes
            .get(&universe_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_leader(&self, universe_id: Uuid, address: &str) {
        self.state
            .lock()
            .unwrap()
            .leaders
            .insert(universe_id, address.to_string());
    }

    pub fn set_follower_lag_ms(&self, lag: u64) {
        self.state.lock().unwrap().follower_lag_ms = lag;
    }

    fn universe(&self, id: Uuid) -> Result<Universe, Error> {
        self.metadata
            .get(id)
            .ok_or_else(|| Error::not_found_by_id(ResourceType::Universe, &id))
    }

    fn with_quorum<T>(
        &self,
        universe_id: Uuid,
        f: impl FnOnce(&mut BTreeSet<String>) -> T,
    ) -> Result<T, Error> {
        let universe = self.universe(universe_id)?;
        let mut state = self.state.lock().unwrap();
        let quorum = state.quorums.entry(universe_id).or_insert_with(|| {
            universe.masters().into_iter().map(|n| n.private_ip).collect()
        });
        Ok(f(quorum))
    }
}

#[async_trait]
impl DatabaseAdmin for SimDatabaseAdmin {
    async fn master_leader_address(
        &self,
        universe_id: Uuid,
    ) -> Result<String, Error> {
        let universe = self.universe(universe_id)?;
        if let Some(leader) = self.state.lock().unwrap().leaders.get(&universe_id)
        {
            return Ok(leader.clone());
        }
        universe.masters().first().map(|n| n.private_ip.clone()).ok_or_else(
            || Error::internal_error("universe has no master leader"),
        )
    }

    async fn master_addresses(
        &self,
        universe_id: Uuid,
    ) -> Result<Vec<String>, Error> {
        self.with_quorum(universe_id, |quorum| quorum.iter().cloned().collect())
    }

    async fn change_master_config(
        &self,
        universe_id: Uuid,
        node: &NodeDetails,
        add: bool,
    ) -> Result<(), Error> {
        let name = &node.node_name;
        if add && !self.node_agent.is_running(name, ServerType::Master) {
            return Err(Error::remote_command_failed(
                name,
                "master is not running",
            ));
        }
        let change = MasterConfigChange {
            node: name.clone(),
            add,
            master_starts: self.node_agent.starts(name, ServerType::Master),
        };
        self.state
            .lock()
            .unwrap()
            .changes
            .entry(universe_id)
            .or_default()
            .push(change);
        self.with_quorum(universe_id, |quorum| {
            if add {
                quorum.insert(node.private_ip.clone());
            } else {
                quorum.remove(&node.private_ip);
            }
        })
    }

    async fn follower_lag_ms(
        &self,
        _universe_id: Uuid,
        _node: &NodeDetails,
        _server_type: ServerType,
    ) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().follower_lag_ms)
    }
}
