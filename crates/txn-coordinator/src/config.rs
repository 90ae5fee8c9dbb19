// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use coordination_client::HandleConfig;
use serde::{Deserialize, Serialize};

use crate::paths::DEFAULT_ROOT_PATH;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CoordinatorConfig {
    /// `host:port` addresses of the coordination service ensemble.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// Node under which every tenant keeps its transaction state.
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_operation_retries")]
    pub operation_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Consecutive failed reconnections after which the process aborts.
    #[serde(default = "default_max_connection_failures")]
    pub max_connection_failures: u32,
    #[serde(default = "default_max_groups_for_xg")]
    pub max_groups_for_xg: usize,
    /// Transactions older than this are collected.
    #[serde(default = "default_max_tx_duration_secs")]
    pub max_tx_duration_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// Per tenant override of `gc_interval_secs`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tenant_gc_interval_secs: BTreeMap<String, u64>,
    /// Default bound on waiting for cross-group locks.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Restarts of an ordered acquisition after yielding to an older transaction.
    #[serde(default = "default_max_lock_retries")]
    pub max_lock_retries: u32,
}

fn default_hosts() -> Vec<String> {
    vec!["localhost:2181".to_owned()]
}

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_owned()
}

fn default_connection_timeout_ms() -> u64 {
    3_000
}

fn default_operation_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_connection_failures() -> u32 {
    10
}

fn default_max_groups_for_xg() -> usize {
    5
}

fn default_max_tx_duration_secs() -> u64 {
    120
}

fn default_gc_interval_secs() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_max_lock_retries() -> u32 {
    10
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            root_path: default_root_path(),
            connection_timeout_ms: default_connection_timeout_ms(),
            operation_retries: default_operation_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_connection_failures: default_max_connection_failures(),
            max_groups_for_xg: default_max_groups_for_xg(),
            max_tx_duration_secs: default_max_tx_duration_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            tenant_gc_interval_secs: BTreeMap::new(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_lock_retries: default_max_lock_retries(),
        }
    }
}

impl CoordinatorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read config from {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Unable to parse config in {}", path.display()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Unable to save config to {}", path.display()))
    }

    pub fn handle_config(&self) -> HandleConfig {
        HandleConfig {
            operation_retries: self.operation_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_connection_failures: self.max_connection_failures,
            operation_timeout: Duration::from_millis(self.connection_timeout_ms),
        }
    }

    pub fn max_tx_duration(&self) -> Duration {
        Duration::from_secs(self.max_tx_duration_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn gc_interval(&self, tenant: &str) -> Duration {
        Duration::from_secs(
            self.tenant_gc_interval_secs
                .get(tenant)
                .copied()
                .unwrap_or(self.gc_interval_secs),
        )
    }

    /// Shortest configured GC interval; the collector wakes up at this pace.
    pub fn min_gc_interval(&self) -> Duration {
        let min = self
            .tenant_gc_interval_secs
            .values()
            .copied()
            .chain(std::iter::once(self.gc_interval_secs))
            .min()
            .unwrap_or(self.gc_interval_secs);
        Duration::from_secs(min.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: CoordinatorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.max_groups_for_xg, 5);
        assert_eq!(config.gc_interval("any"), Duration::from_secs(30));
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.yaml");
        std::fs::write(
            &path,
            "hosts: [\"zk1:2181\", \"zk2:2181\"]\nmax-tx-duration-secs: 60\ntenant-gc-interval-secs:\n  guestbook: 5\n",
        )
        .unwrap();

        let config = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(config.hosts, vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(config.max_tx_duration(), Duration::from_secs(60));
        assert_eq!(config.gc_interval("guestbook"), Duration::from_secs(5));
        assert_eq!(config.gc_interval("other"), Duration::from_secs(30));
        assert_eq!(config.min_gc_interval(), Duration::from_secs(5));

        let copy = dir.path().join("copy.yaml");
        config.save(&copy).unwrap();
        assert_eq!(CoordinatorConfig::load(&copy).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CoordinatorConfig::load("/nonexistent/coordinator.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("Unable to read config"));
    }
}
