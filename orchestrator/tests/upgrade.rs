// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade tasks run end to end against the simulated fleet

use dropshot::test_util::LogContext;
use fleet_common::universe::NodeState;
use fleet_common::universe::ServerType;
use fleet_common::universe::Universe;
use fleet_orchestrator::config::ExecutorConfig;
use fleet_orchestrator::config::UpgradeConfig;
use fleet_orchestrator::executor::InMemoryTaskInfoStore;
use fleet_orchestrator::executor::TaskExecutor;
use fleet_orchestrator::executor::TaskInfo;
use fleet_orchestrator::executor::TaskState;
use fleet_orchestrator::executor::TaskType;
use fleet_orchestrator::sim::LoadBalancerEvent;
use fleet_orchestrator::sim::MasterConfigChange;
use fleet_orchestrator::sim::NodeEvent;
use fleet_orchestrator::sim::SimServices;
use fleet_orchestrator::sim::UniverseBuilder;
use fleet_orchestrator::sim::SIM_SOFTWARE_VERSION;
use fleet_orchestrator::tasks::register_all;
use fleet_orchestrator::test_util::test_setup_log;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    logctx: LogContext,
    sim: SimServices,
    executor: TaskExecutor,
    universe_id: Uuid,
}

impl Harness {
    fn new(test_name: &str, universe: Universe, blacklist: bool) -> Harness {
        let config = UpgradeConfig {
            blacklist_leaders: blacklist,
            ..test_config()
        };
        Harness::with_config(test_name, universe, &config)
    }

    fn with_config(
        test_name: &str,
        universe: Universe,
        config: &UpgradeConfig,
    ) -> Harness {
        let logctx = test_setup_log(test_name);
        let universe_id = universe.id;
        let sim = SimServices::new(&logctx.log, vec![universe]);
        let mut executor = TaskExecutor::new(
            &logctx.log,
            sim.services(),
            Arc::new(InMemoryTaskInfoStore::new()),
            &ExecutorConfig::default(),
        );
        register_all(&mut executor, config);
        Harness { logctx, sim, executor, universe_id }
    }

    fn universe(&self) -> Universe {
        self.sim.metadata.get(self.universe_id).expect("universe exists")
    }

    async fn run(
        &self,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> TaskInfo {
        let id = self.executor.submit(task_type, params).await.unwrap();
        self.executor.wait_for_task(id).await.unwrap()
    }

    /// Returns the nodes `process` was stopped on, in order
    fn stops(&self, process: ServerType) -> Vec<String> {
        self.sim
            .node_agent
            .events()
            .into_iter()
            .filter_map(|event| match event {
                NodeEvent::Stop { node, process: p } if p == process => {
                    Some(node)
                }
                _ => None,
            })
            .collect()
    }

    fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}

fn test_config() -> UpgradeConfig {
    UpgradeConfig {
        server_wait_timeout: Duration::from_secs(5),
        sql_probe_interval: Duration::from_millis(10),
        sql_probe_timeout: Duration::from_secs(5),
        follower_lag_poll_interval: Duration::from_millis(10),
        follower_lag_max_polls: 10,
        ..Default::default()
    }
}

fn restart_params(universe_id: Uuid, option: &str) -> serde_json::Value {
    json!({
        "universe_id": universe_id,
        "expected_universe_version": 0,
        "upgrade_option": option,
    })
}

#[tokio::test]
async fn test_rolling_restart() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_rolling_restart", universe, false);
    let id = h.universe_id;

    let info = h.run(TaskType::RestartUniverse, restart_params(id, "rolling")).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // The master leader (the first master) restarts last.  Tservers follow
    // in index order.
    assert_eq!(h.stops(ServerType::Master), vec!["u-n2", "u-n3", "u-n1"]);
    assert_eq!(h.stops(ServerType::TServer), vec!["u-n1", "u-n2", "u-n3"]);
    let events = h.sim.node_agent.events();
    let last_master_stop = events
        .iter()
        .rposition(|e| {
            matches!(e, NodeEvent::Stop { process: ServerType::Master, .. })
        })
        .unwrap();
    let first_tserver_stop = events
        .iter()
        .position(|e| {
            matches!(e, NodeEvent::Stop { process: ServerType::TServer, .. })
        })
        .unwrap();
    assert!(last_master_stop < first_tserver_stop);

    // The SQL endpoint of every node was probed once it came back.
    for node in ["u-n1", "u-n2", "u-n3"] {
        assert!(h.sim.node_agent.is_running(node, ServerType::Master));
        assert!(h.sim.node_agent.is_running(node, ServerType::TServer));
        assert!(h
            .sim
            .node_agent
            .commands(node)
            .iter()
            .any(|argv| argv[0] == "ysqlsh"));
    }

    // The load balancer is only turned off around the tservers.
    assert_eq!(
        h.sim.load_balancer.events(id),
        vec![
            LoadBalancerEvent::SetEnabled(false),
            LoadBalancerEvent::SetEnabled(true),
        ]
    );

    let universe = h.universe();
    assert!(universe.nodes.iter().all(|n| n.state == NodeState::Live));
    assert_eq!(universe.version, 1);
    assert!(!universe.update_in_progress);
    assert!(universe.update_succeeded);

    let (done, total) = info.progress();
    assert_eq!(done, total);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_rolling_restart_stale_version() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_rolling_restart_stale_version", universe, false);
    let params = json!({
        "universe_id": h.universe_id,
        "expected_universe_version": 7,
        "upgrade_option": "rolling",
    });

    let info = h.run(TaskType::RestartUniverse, params).await;
    assert_eq!(info.state, TaskState::Failure);
    assert!(h.sim.node_agent.events().is_empty());
    let universe = h.universe();
    assert_eq!(universe.version, 0);
    assert!(!universe.update_in_progress);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_non_rolling_restart() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_non_rolling_restart", universe, false);
    let id = h.universe_id;

    let info =
        h.run(TaskType::RestartUniverse, restart_params(id, "non_rolling")).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // Every process was stopped before any was started again.
    let events = h.sim.node_agent.events();
    let last_stop = events
        .iter()
        .rposition(|e| matches!(e, NodeEvent::Stop { .. }))
        .unwrap();
    let first_start = events
        .iter()
        .position(|e| matches!(e, NodeEvent::Start { .. }))
        .unwrap();
    assert!(last_stop < first_start);
    assert_eq!(h.stops(ServerType::Master).len(), 3);
    assert_eq!(h.stops(ServerType::TServer).len(), 3);
    assert!(h.sim.load_balancer.events(id).is_empty());

    let universe = h.universe();
    assert!(universe.nodes.iter().all(|n| n.state == NodeState::Live));
    assert_eq!(universe.version, 1);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_start_failure_reenables_load_balancer() {
    let universe = UniverseBuilder::new("u")
        .masters_and_tservers(3)
        .tservers_only(1)
        .build();
    let h = Harness::new(
        "test_start_failure_reenables_load_balancer",
        universe,
        false,
    );
    let id = h.universe_id;
    h.sim.node_agent.fail_start("u-n4");

    let info = h.run(TaskType::RestartUniverse, restart_params(id, "rolling")).await;
    assert_eq!(info.state, TaskState::Failure);
    assert!(info.error.is_some());

    // The load balancer disabled for the tservers was turned back on by the
    // compensation step.
    assert!(h.sim.load_balancer.is_enabled(id));
    assert_eq!(
        h.sim.load_balancer.events(id).last(),
        Some(&LoadBalancerEvent::SetEnabled(true))
    );

    let universe = h.universe();
    let failed = universe.node("u-n4").unwrap();
    assert_ne!(failed.state, NodeState::Live);
    assert_eq!(universe.version, 0);
    assert!(!universe.update_in_progress);
    assert!(!universe.update_succeeded);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_start_failure_clears_blacklist() {
    let universe = UniverseBuilder::new("u")
        .masters_and_tservers(3)
        .tservers_only(1)
        .build();
    let h = Harness::new("test_start_failure_clears_blacklist", universe, true);
    let id = h.universe_id;
    h.sim.node_agent.fail_start("u-n4");

    let info = h.run(TaskType::RestartUniverse, restart_params(id, "rolling")).await;
    assert_eq!(info.state, TaskState::Failure);

    // Nodes restarted before the failure were already taken off the
    // blacklist.  Only the failed node is left for the compensation step.
    assert!(h.sim.load_balancer.blacklist(id).is_empty());
    let events = h.sim.load_balancer.events(id);
    assert!(!events.contains(&LoadBalancerEvent::SetEnabled(false)));
    assert_eq!(
        events.last(),
        Some(&LoadBalancerEvent::Blacklist {
            nodes: vec!["u-n4".to_string()],
            add: false,
        })
    );
    h.cleanup_successful();
}

#[tokio::test]
async fn test_software_upgrade() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_software_upgrade", universe, false);
    let id = h.universe_id;
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "rolling",
        "software_version": "2.20.1.0-b97",
    });

    let info = h.run(TaskType::SoftwareUpgrade, params).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    for node in ["u-n1", "u-n2", "u-n3"] {
        let commands = h.sim.node_agent.commands(node);
        let installs: Vec<_> = commands
            .iter()
            .filter(|argv| argv[0] == "install-software")
            .collect();
        assert_eq!(installs.len(), 2, "{}: {:?}", node, commands);
        assert!(installs.iter().all(|argv| argv[2] == "2.20.1.0-b97"));
        assert!(commands.iter().any(|argv| argv[0] == "download-software"));
        assert!(commands
            .iter()
            .any(|argv| argv[0] == "check-software-version"));
    }

    let universe = h.universe();
    let intent = &universe.primary_cluster().unwrap().user_intent;
    assert_eq!(intent.software_version, "2.20.1.0-b97");
    assert_eq!(universe.version, 1);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_software_upgrade_same_version() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_software_upgrade_same_version", universe, false);
    let params = json!({
        "universe_id": h.universe_id,
        "expected_universe_version": 0,
        "upgrade_option": "rolling",
        "software_version": SIM_SOFTWARE_VERSION,
    });

    let info = h.run(TaskType::SoftwareUpgrade, params).await;
    assert_eq!(info.state, TaskState::Failure);
    assert!(h.sim.node_agent.events().is_empty());

    // The lock was released without bumping the version.
    let universe = h.universe();
    assert_eq!(universe.version, 0);
    assert!(!universe.update_in_progress);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_install_failure_stops_upgrade() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_install_failure_stops_upgrade", universe, false);
    let id = h.universe_id;
    h.sim.node_agent.fail_command("u-n3", "install-software");
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "rolling",
        "software_version": "2.20.1.0-b97",
    });

    let info = h.run(TaskType::SoftwareUpgrade, params).await;
    assert_eq!(info.state, TaskState::Failure);

    // u-n2 went first, then u-n3 failed; the leader was never touched.
    assert_eq!(h.stops(ServerType::Master), vec!["u-n2", "u-n3"]);
    assert!(h.stops(ServerType::TServer).is_empty());
    let universe = h.universe();
    let intent = &universe.primary_cluster().unwrap().user_intent;
    assert_eq!(intent.software_version, SIM_SOFTWARE_VERSION);
    assert_eq!(universe.node("u-n1").unwrap().state, NodeState::Live);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_gflags_upgrade_without_restart() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_gflags_upgrade_without_restart", universe, false);
    let id = h.universe_id;
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "non_restart",
        "tserver_gflags": { "ysql_max_connections": "300" },
    });

    let info = h.run(TaskType::GFlagsUpgrade, params).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // Only the tserver flags changed, and nothing was restarted.
    let events = h.sim.node_agent.events();
    assert!(events.iter().all(|e| matches!(e, NodeEvent::Command { .. })));
    assert!(h.sim.load_balancer.events(id).is_empty());
    for node in ["u-n1", "u-n2", "u-n3"] {
        let updates: Vec<_> = h
            .sim
            .node_agent
            .commands(node)
            .into_iter()
            .filter(|argv| argv[0] == "update-gflags")
            .collect();
        assert_eq!(updates.len(), 1, "{}: {:?}", node, updates);
        assert!(updates[0].contains(&"ysql_max_connections=300".to_string()));
    }

    let universe = h.universe();
    let intent = &universe.primary_cluster().unwrap().user_intent;
    assert_eq!(
        intent.tserver_gflags.get("ysql_max_connections").map(String::as_str),
        Some("300")
    );
    assert!(universe.nodes.iter().all(|n| n.state == NodeState::Live));
    assert_eq!(universe.version, 1);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_gflags_upgrade_without_changes() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_gflags_upgrade_without_changes", universe, false);
    let params = restart_params(h.universe_id, "rolling");

    let info = h.run(TaskType::GFlagsUpgrade, params).await;
    assert_eq!(info.state, TaskState::Failure);
    assert!(h.sim.node_agent.events().is_empty());
    assert_eq!(h.universe().version, 0);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_certs_rotate_stages_before_stopping() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h =
        Harness::new("test_certs_rotate_stages_before_stopping", universe, false);
    let id = h.universe_id;
    let root_ca = Uuid::new_v4();
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "rolling",
        "root_ca": root_ca,
    });

    let info = h.run(TaskType::CertsRotate, params).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // On every node, the new certificates are in place before the first
    // process goes down.
    let events = h.sim.node_agent.events();
    for node in ["u-n1", "u-n2", "u-n3"] {
        let first_rotate = events
            .iter()
            .position(|e| match e {
                NodeEvent::Command { node: n, argv } => {
                    n == node && argv[0] == "rotate-certs"
                }
                _ => false,
            })
            .unwrap();
        let first_stop = events
            .iter()
            .position(|e| matches!(e, NodeEvent::Stop { .. }) && e.node() == node)
            .unwrap();
        assert!(first_rotate < first_stop, "{}", node);
    }

    let universe = h.universe();
    let intent = &universe.primary_cluster().unwrap().user_intent;
    assert_eq!(intent.root_ca, Some(root_ca));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_resize_node() {
    use fleet_orchestrator::external::DatabaseAdmin;

    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_resize_node", universe, false);
    let id = h.universe_id;
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "rolling",
        "instance_type": "c5.2xlarge",
    });

    let info = h.run(TaskType::ResizeNode, params).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // Each node is taken down as a whole, one at a time.
    assert_eq!(h.sim.node_agent.stop_order().len(), 3);
    for node in ["u-n1", "u-n2", "u-n3"] {
        assert!(h
            .sim
            .node_agent
            .commands(node)
            .iter()
            .any(|argv| argv[0] == "change-instance-type"));
    }

    // Every master left the quorum while down and rejoined it afterwards.
    let mut quorum = h.sim.db_admin.master_addresses(id).await.unwrap();
    quorum.sort();
    assert_eq!(quorum, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

    let universe = h.universe();
    let intent = &universe.primary_cluster().unwrap().user_intent;
    assert_eq!(intent.instance_type, "c5.2xlarge");
    assert!(universe.nodes.iter().all(|n| n.state == NodeState::Live));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_resize_node_reconfigures_masters() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_resize_node_reconfigures_masters", universe, false);
    let id = h.universe_id;
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "rolling",
        "instance_type": "c5.2xlarge",
    });

    let info = h.run(TaskType::ResizeNode, params).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // Each master leaves the quorum before its master is started again and
    // rejoins once it is back.  The leader goes last.
    let change = |node: &str, add: bool, master_starts: usize| {
        MasterConfigChange { node: node.to_string(), add, master_starts }
    };
    assert_eq!(
        h.sim.db_admin.master_config_changes(id),
        vec![
            change("u-n2", false, 0),
            change("u-n2", true, 1),
            change("u-n3", false, 0),
            change("u-n3", true, 1),
            change("u-n1", false, 0),
            change("u-n1", true, 1),
        ]
    );
    h.cleanup_successful();
}

#[tokio::test]
async fn test_follower_lag_timeout() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let h = Harness::new("test_follower_lag_timeout", universe, false);
    let id = h.universe_id;
    h.sim.db_admin.set_follower_lag_ms(60_000);

    let info = h.run(TaskType::RestartUniverse, restart_params(id, "rolling")).await;
    assert_eq!(info.state, TaskState::Failure);
    let error = info.error.as_deref().unwrap();
    assert!(error.contains("Timed out"), "{}", error);
    assert!(error.contains("follower lag"), "{}", error);

    // The first node restarted, but the upgrade gave up on it before
    // marking it live or moving on.
    assert_eq!(h.stops(ServerType::Master), vec!["u-n2"]);
    let universe = h.universe();
    assert_ne!(universe.node("u-n2").unwrap().state, NodeState::Live);
    assert_eq!(universe.node("u-n3").unwrap().state, NodeState::Live);
    assert_eq!(universe.version, 0);
    assert!(!universe.update_in_progress);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_sql_probe_timeout() {
    let universe = UniverseBuilder::new("u").masters_and_tservers(3).build();
    let config = UpgradeConfig {
        sql_probe_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let h = Harness::with_config("test_sql_probe_timeout", universe, &config);
    let id = h.universe_id;
    h.sim.node_agent.fail_command("u-n1", "ysqlsh");

    let info = h.run(TaskType::RestartUniverse, restart_params(id, "rolling")).await;
    assert_eq!(info.state, TaskState::Failure);
    let error = info.error.as_deref().unwrap();
    assert!(error.contains("Timed out"), "{}", error);
    assert!(error.contains("sql endpoint"), "{}", error);

    // Masters were all done; the first tserver never became reachable over
    // SQL, so the ones after it were left alone.
    assert_eq!(h.stops(ServerType::Master).len(), 3);
    assert_eq!(h.stops(ServerType::TServer), vec!["u-n1"]);
    let universe = h.universe();
    assert_ne!(universe.node("u-n1").unwrap().state, NodeState::Live);
    assert!(h.sim.load_balancer.is_enabled(id));
    assert_eq!(universe.version, 0);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_failed_compensation_keeps_upgrade_error() {
    let universe = UniverseBuilder::new("u")
        .masters_and_tservers(3)
        .tservers_only(1)
        .build();
    let h = Harness::new(
        "test_failed_compensation_keeps_upgrade_error",
        universe,
        false,
    );
    let id = h.universe_id;
    h.sim.node_agent.fail_start("u-n4");
    h.sim.load_balancer.fail_enable(id);

    let info = h.run(TaskType::RestartUniverse, restart_params(id, "rolling")).await;
    assert_eq!(info.state, TaskState::Failure);
    let error = info.error.as_deref().unwrap();
    assert!(error.contains("u-n4"), "{}", error);
    assert!(error.contains("failed to start"), "{}", error);

    // Re-enabling the load balancer failed, but the universe was still
    // unlocked.
    assert!(!h.sim.load_balancer.is_enabled(id));
    let universe = h.universe();
    assert_eq!(universe.version, 0);
    assert!(!universe.update_in_progress);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_non_rolling_gflags_reach_inactive_masters() {
    let universe = UniverseBuilder::new("u")
        .masters_and_tservers(3)
        .tservers_only(1)
        .build();
    let h = Harness::new(
        "test_non_rolling_gflags_reach_inactive_masters",
        universe,
        false,
    );
    let id = h.universe_id;
    let params = json!({
        "universe_id": id,
        "expected_universe_version": 0,
        "upgrade_option": "non_rolling",
        "master_gflags": { "raft_heartbeat_interval_ms": "600" },
    });

    let info = h.run(TaskType::GFlagsUpgrade, params).await;
    assert_eq!(info.state, TaskState::Success, "error: {:?}", info.error);

    // The tserver-only node got the master flags too.
    let updates: Vec<_> = h
        .sim
        .node_agent
        .commands("u-n4")
        .into_iter()
        .filter(|argv| argv[0] == "update-gflags")
        .collect();
    assert_eq!(updates.len(), 1, "{:?}", updates);
    assert_eq!(updates[0][2], "master");
    assert!(updates[0].contains(&"raft_heartbeat_interval_ms=600".to_string()));

    // Its master was stopped and left down; its tserver was not touched.
    let mut master_stops = h.stops(ServerType::Master);
    master_stops.sort();
    assert_eq!(master_stops, vec!["u-n1", "u-n2", "u-n3", "u-n4"]);
    assert!(h.stops(ServerType::TServer).is_empty());
    assert_eq!(h.sim.node_agent.starts("u-n4", ServerType::Master), 0);
    assert!(h.sim.node_agent.is_running("u-n4", ServerType::TServer));
    for node in ["u-n1", "u-n2", "u-n3"] {
        assert_eq!(h.sim.node_agent.starts(node, ServerType::Master), 1);
    }

    let universe = h.universe();
    assert!(universe.nodes.iter().all(|n| n.state == NodeState::Live));
    assert_eq!(universe.version, 1);
    h.cleanup_successful();
}
