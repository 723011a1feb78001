// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the collaborators the orchestrator drives
//!
//! Everything that actually touches a node, a cloud resource, the database's
//! own processes or persistent storage sits behind one of these traits.  The
//! orchestrator decides *when* to call them; implementations decide *how*.
//! None of them retry internally on the orchestrator's behalf.
//!
//! [`crate::sim`] provides in-memory implementations of all of them.

use async_trait::async_trait;
use fleet_common::backup::Backup;
use fleet_common::backup::BackupState;
use fleet_common::backup::Schedule;
use fleet_common::backup::StorageConfig;
use fleet_common::universe::NodeDetails;
use fleet_common::universe::ServerType;
use fleet_common::universe::Universe;
use fleet_common::Error;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Output of a command run on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process control on individual nodes
#[async_trait]
pub trait NodeAgent: Send + Sync {
    async fn stop_process(
        &self,
        node: &NodeDetails,
        process: ServerType,
    ) -> Result<(), Error>;

    async fn start_process(
        &self,
        node: &NodeDetails,
        process: ServerType,
    ) -> Result<(), Error>;

    /// Waits up to `timeout` for `process` to accept RPCs.  Returns whether
    /// it did.
    async fn wait_for_rpc(
        &self,
        node: &NodeDetails,
        process: ServerType,
        timeout: Duration,
    ) -> Result<bool, Error>;

    async fn run_remote_command(
        &self,
        node: &NodeDetails,
        argv: &[String],
    ) -> Result<CommandOutput, Error>;
}

/// Change applied to a universe record inside
/// [`ClusterMetadataStore::cas_update_universe`]
///
/// If the mutator fails, the record is left untouched and its error is
/// returned to the caller.
pub type UniverseMutator =
    Box<dyn FnOnce(&mut Universe) -> Result<(), Error> + Send>;

/// Persistent storage of universe records
#[async_trait]
pub trait ClusterMetadataStore: Send + Sync {
    async fn load_universe(&self, id: Uuid) -> Result<Universe, Error>;

    /// Atomically applies `mutator` to the universe's record
    ///
    /// When `expected_version` is given, the update fails with
    /// [`Error::ConcurrentModification`] unless the stored version matches.
    /// The check, the mutator and the write happen as one transaction.
    /// Returns the record as written.
    async fn cas_update_universe(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        mutator: UniverseMutator,
    ) -> Result<Universe, Error>;

    async fn list_universes(&self) -> Result<Vec<Universe>, Error>;
}

/// Control of the database's tablet load balancer and leader placement
#[async_trait]
pub trait LoadBalancerControl: Send + Sync {
    async fn set_enabled(
        &self,
        universe_id: Uuid,
        enabled: bool,
    ) -> Result<(), Error>;

    /// Adds `nodes` to (`add == true`) or removes them from the universe's
    /// leader blacklist
    async fn set_leader_blacklist(
        &self,
        universe_id: Uuid,
        nodes: &[NodeDetails],
        add: bool,
    ) -> Result<(), Error>;
}

/// RPCs issued to the database's own processes
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Returns the private address of the current master leader.
    async fn master_leader_address(
        &self,
        universe_id: Uuid,
    ) -> Result<String, Error>;

    /// Returns the private addresses of the current master quorum.
    async fn master_addresses(
        &self,
        universe_id: Uuid,
    ) -> Result<Vec<String>, Error>;

    /// Adds `node` to (`add == true`) or removes it from the master quorum
    async fn change_master_config(
        &self,
        universe_id: Uuid,
        node: &NodeDetails,
        add: bool,
    ) -> Result<(), Error>;

    /// Returns how far (in milliseconds) `node`'s replicas for
    /// `server_type` trail their leaders.
    async fn follower_lag_ms(
        &self,
        universe_id: Uuid,
        node: &NodeDetails,
        server_type: ServerType,
    ) -> Result<u64, Error>;
}

/// Persistent storage of backups, schedules and storage configs
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn list_backups(&self) -> Result<Vec<Backup>, Error>;

    /// Returns `None` if the backup no longer exists.
    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>, Error>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, Error>;

    /// Checks that the backup's storage destination is usable.  An error
    /// means the backup cannot be deleted right now.
    async fn validate_storage_config(&self, backup: &Backup)
        -> Result<(), Error>;

    async fn transition_state(
        &self,
        id: Uuid,
        state: BackupState,
    ) -> Result<(), Error>;

    /// Removes the backup's data from its storage destination
    async fn delete_backup_data(&self, backup: &Backup) -> Result<(), Error>;

    async fn delete_backup_record(&self, id: Uuid) -> Result<(), Error>;

    async fn list_storage_configs_queued_for_deletion(
        &self,
    ) -> Result<Vec<StorageConfig>, Error>;

    async fn delete_storage_config(&self, id: Uuid) -> Result<(), Error>;
}

/// Outcome of a helper-agent upgrade on one node, as reported by the node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentUpgradeResult {
    InProgress,
    Complete,
    Failed,
}

/// The in-cluster helper agent running on every node
#[async_trait]
pub trait ComponentAgent: Send + Sync {
    /// Returns whether the agent on `node` answers within `timeout`.
    async fn probe(
        &self,
        node: &NodeDetails,
        timeout: Duration,
    ) -> Result<bool, Error>;

    /// Asks the agent on `node` to upgrade itself to `version` from the
    /// package at `location`
    async fn request_upgrade(
        &self,
        node: &NodeDetails,
        version: &str,
        location: &str,
    ) -> Result<(), Error>;

    async fn upgrade_result(
        &self,
        node: &NodeDetails,
        version: &str,
    ) -> Result<ComponentUpgradeResult, Error>;

    /// Copies the `version` package onto `node` so an upgrade can proceed
    /// from local disk.  Returns the package's location on the node.
    async fn stage_local_package(
        &self,
        node: &NodeDetails,
        version: &str,
    ) -> Result<String, Error>;
}

/// Handles to every collaborator, shared by all tasks
#[derive(Clone)]
pub struct Services {
    pub node_agent: Arc<dyn NodeAgent>,
    pub metadata: Arc<dyn ClusterMetadataStore>,
    pub load_balancer: Arc<dyn LoadBalancerControl>,
    pub db_admin: Arc<dyn DatabaseAdmin>,
    pub backups: Arc<dyn BackupStore>,
    pub components: Arc<dyn ComponentAgent>,
}
