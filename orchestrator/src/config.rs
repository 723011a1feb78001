// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files for the orchestrator

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use serde_with::DurationSeconds;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the orchestrator
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
    pub background: BackgroundTasksConfig,
}

impl OrchestratorConfig {
    /// Load an `OrchestratorConfig` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<OrchestratorConfig, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: OrchestratorConfig = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExecutorConfig {
    /// maximum number of subtasks of one group that run at the same time
    pub max_parallel_subtasks: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig { max_parallel_subtasks: 16 }
    }
}

/// Tunables for the rolling-upgrade state machine
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UpgradeConfig {
    /// Blacklist tserver leaders around each node restart instead of
    /// disabling the load balancer for the whole node set.
    pub blacklist_leaders: bool,
    /// how long to wait for a restarted process to accept RPCs
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "server_wait_timeout_secs")]
    pub server_wait_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "sql_probe_interval_secs")]
    pub sql_probe_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "sql_probe_timeout_secs")]
    pub sql_probe_timeout: Duration,
    /// replication lag a restarted node must drop below before the next node
    /// is touched
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "follower_lag_threshold_ms")]
    pub follower_lag_threshold: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "follower_lag_poll_interval_secs")]
    pub follower_lag_poll_interval: Duration,
    pub follower_lag_max_polls: u32,
    /// command run on every node of the universe before the upgrade starts
    #[serde(default)]
    pub pre_upgrade_hook: Option<Vec<String>>,
    /// command run on every node of the universe after the upgrade finishes
    #[serde(default)]
    pub post_upgrade_hook: Option<Vec<String>>,
    /// command run on a node before it is touched by a rolling upgrade
    #[serde(default)]
    pub pre_node_hook: Option<Vec<String>>,
    /// command run on a node after a rolling upgrade brought it back
    #[serde(default)]
    pub post_node_hook: Option<Vec<String>>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        UpgradeConfig {
            blacklist_leaders: false,
            server_wait_timeout: Duration::from_secs(300),
            sql_probe_interval: Duration::from_secs(5),
            sql_probe_timeout: Duration::from_secs(300),
            follower_lag_threshold: Duration::from_millis(1000),
            follower_lag_poll_interval: Duration::from_secs(5),
            follower_lag_max_polls: 60,
            pre_upgrade_hook: None,
            post_upgrade_hook: None,
            pre_node_hook: None,
            post_node_hook: None,
        }
    }
}

/// Configuration for the periodic background tasks
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BackgroundTasksConfig {
    pub backup_gc: BackupGcConfig,
    pub component_upgrade: ComponentUpgradeConfig,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BackupGcConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "period_secs")]
    pub period: Duration,
    /// how long to sleep between checks on submitted deletions
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "poll_interval_secs")]
    pub poll_interval: Duration,
    /// how many checks on submitted deletions to make before giving up on
    /// them for the rest of the epoch
    pub max_poll_tries: u32,
    /// maximum number of deletions submitted per epoch
    pub max_batch: usize,
    /// retention floor for schedules that do not set one
    pub default_min_backups_to_retain: usize,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ComponentUpgradeConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "period_secs")]
    pub period: Duration,
    /// version of the helper agent every universe should converge on
    pub stable_version: String,
    /// where nodes download the helper agent package from
    pub package_location: String,
    pub universe_batch_size: usize,
    /// limit on the sum of node counts of the universes in one batch
    pub node_batch_size: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "poll_interval_secs")]
    pub poll_interval: Duration,
    pub max_poll_tries: u32,
    /// whether this task does anything at all
    pub allow_scheduled_upgrade: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "probe_timeout_secs")]
    pub probe_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "result_poll_interval_secs")]
    pub result_poll_interval: Duration,
    pub result_max_polls: u32,
}

#[cfg(test)]
mod test {
    use super::LoadError;
    use super::OrchestratorConfig;
    use assert_matches::assert_matches;
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use dropshot::ConfigLogging;
    use dropshot::ConfigLoggingLevel;
    use std::time::Duration;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> camino::Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const BACKGROUND: &str = r#"
        [background.backup_gc]
        period_secs = 3600
        poll_interval_secs = 10
        max_poll_tries = 30
        max_batch = 20
        default_min_backups_to_retain = 5

        [background.component_upgrade]
        period_secs = 600
        stable_version = "2.1.0-b7"
        package_location = "/opt/fleet/packages"
        universe_batch_size = 4
        node_batch_size = 30
        poll_interval_secs = 20
        max_poll_tries = 15
        allow_scheduled_upgrade = true
        probe_timeout_secs = 5
        result_poll_interval_secs = 2
        result_max_polls = 30
    "#;

    #[test]
    fn test_config_nonexistent() {
        let error = OrchestratorConfig::from_file(Utf8Path::new("/nonexistent"))
            .expect_err("expected config to fail from nonexistent file");
        assert_matches!(error, LoadError::Io { .. });
    }

    #[test]
    fn test_config_bad_toml() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(&dir, "foo =");
        let error = OrchestratorConfig::from_file(&path)
            .expect_err("expected failure on bad TOML");
        assert_matches!(error, LoadError::Parse { .. });
        assert!(error.to_string().contains(path.as_str()));
    }

    #[test]
    fn test_config_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let contents = format!(
            "[log]\nmode = \"stderr-terminal\"\nlevel = \"info\"\n{}",
            BACKGROUND
        );
        let path = write_config(&dir, &contents);
        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_matches!(
            config.log,
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
        );
        assert_eq!(config.executor.max_parallel_subtasks, 16);
        assert!(!config.upgrade.blacklist_leaders);
        assert_eq!(config.upgrade.pre_node_hook, None);
        assert_eq!(
            config.background.backup_gc.period,
            Duration::from_secs(3600)
        );
        assert_eq!(config.background.component_upgrade.node_batch_size, 30);
    }

    #[test]
    fn test_config_full() {
        let dir = Utf8TempDir::new().unwrap();
        let contents = format!(
            r#"
            [log]
            mode = "file"
            level = "debug"
            path = "/var/log/fleet.log"
            if_exists = "append"

            [executor]
            max_parallel_subtasks = 4

            [upgrade]
            blacklist_leaders = true
            server_wait_timeout_secs = 120
            sql_probe_interval_secs = 2
            sql_probe_timeout_secs = 60
            follower_lag_threshold_ms = 250
            follower_lag_poll_interval_secs = 1
            follower_lag_max_polls = 10
            pre_node_hook = ["/opt/hooks/drain", "--quiet"]
            post_node_hook = ["/opt/hooks/undrain"]
            {}
            "#,
            BACKGROUND
        );
        let path = write_config(&dir, &contents);
        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(config.executor.max_parallel_subtasks, 4);
        assert!(config.upgrade.blacklist_leaders);
        assert_eq!(
            config.upgrade.follower_lag_threshold,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.upgrade.pre_node_hook,
            Some(vec!["/opt/hooks/drain".to_string(), "--quiet".to_string()])
        );
        assert_eq!(config.upgrade.post_upgrade_hook, None);
        assert_eq!(
            config.background.component_upgrade.result_poll_interval,
            Duration::from_secs(2)
        );
    }
}
