// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated implementations of every collaborator
//!
//! These keep all of their state in memory and make it available for
//! inspection, so that tests can drive complete tasks and then check what
//! happened to the fleet.  Each also supports injecting the failures tests
//! need.

mod backup;
mod cluster;
mod node;
mod universe;

pub use backup::SimBackupStore;
pub use cluster::LoadBalancerEvent;
pub use cluster::MasterConfigChange;
pub use cluster::SimDatabaseAdmin;
pub use cluster::SimLoadBalancer;
pub use cluster::SimMetadataStore;
pub use node::NodeEvent;
pub use node::SimComponentAgent;
pub use node::SimNodeAgent;
pub use universe::UniverseBuilder;
pub use universe::SIM_INSTANCE_TYPE;
pub use universe::SIM_SOFTWARE_VERSION;

use crate::external::Services;
use fleet_common::universe::Universe;
use slog::o;
use slog::Logger;
use std::sync::Arc;

/// One simulated instance of every collaborator
pub struct SimServices {
    pub node_agent: Arc<SimNodeAgent>,
    pub metadata: Arc<SimMetadataStore>,
    pub load_balancer: Arc<SimLoadBalancer>,
    pub db_admin: Arc<SimDatabaseAdmin>,
    pub backups: Arc<SimBackupStore>,
    pub components: Arc<SimComponentAgent>,
}

impl SimServices {
    pub fn new(log: &Logger, universes: Vec<Universe>) -> SimServices {
        let log = log.new(o!("component" => "SimServices"));
        let metadata = Arc::new(SimMetadataStore::new(universes));
        let node_agent = Arc::new(SimNodeAgent::new(&log));
        SimServices {
            db_admin: Arc::new(SimDatabaseAdmin::new(
                Arc::clone(&metadata),
                Arc::clone(&node_agent),
            )),
            node_agent,
            metadata,
            load_balancer: Arc::new(SimLoadBalancer::new()),
            backups: Arc::new(SimBackupStore::new()),
            components: Arc::new(SimComponentAgent::new(&log)),
        }
    }

    /// Returns the handles tasks use to reach these collaborators
    pub fn services(&self) -> Services {
        Services {
            node_agent: self.node_agent.clone(),
            metadata: self.metadata.clone(),
            load_balancer: self.load_balancer.clone(),
            db_admin: self.db_admin.clone(),
            backups: self.backups.clone(),
            components: self.components.clone(),
        }
    }
}
