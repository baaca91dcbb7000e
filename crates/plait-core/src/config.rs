use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level `plait.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaitConfig {
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub replica: ReplicaConfig,
    /// Buffered events per live subscriber before it starts lagging.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Topics bootstrapped concurrently when a node starts.
    #[serde(default = "default_bootstrap_parallelism")]
    pub bootstrap_parallelism: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replica: ReplicaConfig::default(),
            subscriber_capacity: default_subscriber_capacity(),
            bootstrap_parallelism: default_bootstrap_parallelism(),
        }
    }
}

/// Queue sizes and retry policy of one topic replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    #[serde(default = "default_receive_capacity")]
    pub receive_capacity: usize,
    #[serde(default = "default_sync_capacity")]
    pub sync_capacity: usize,
    #[serde(default = "default_links_capacity")]
    pub links_capacity: usize,
    /// Processing attempts per queued item before it is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Non-blocking push attempts into a full queue before dead-lettering.
    #[serde(default = "default_enqueue_attempts")]
    pub enqueue_attempts: u32,
    /// Period of the missing-link repair sweep; 0 disables the timer, but
    /// dead letters and abandoned items still trigger a sweep.
    #[serde(default = "default_repair_interval_ms")]
    pub repair_interval_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            receive_capacity: default_receive_capacity(),
            sync_capacity: default_sync_capacity(),
            links_capacity: default_links_capacity(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            enqueue_attempts: default_enqueue_attempts(),
            repair_interval_ms: default_repair_interval_ms(),
        }
    }
}

impl ReplicaConfig {
    /// Delay before retry number `attempts` (1-based): the base delay
    /// doubled per previous attempt, capped at `max_backoff_ms`.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(32);
        let delay = self.retry_backoff_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    #[must_use]
    pub fn repair_interval(&self) -> Option<Duration> {
        (self.repair_interval_ms > 0).then(|| Duration::from_millis(self.repair_interval_ms))
    }
}

/// Load a TOML file into `T`, returning `T::default()` if it does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_toml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<T>(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load `plait.toml`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<PlaitConfig> {
    load_toml(path)
}

const fn default_subscriber_capacity() -> usize {
    64
}

const fn default_bootstrap_parallelism() -> usize {
    16
}

const fn default_receive_capacity() -> usize {
    20
}

const fn default_sync_capacity() -> usize {
    20
}

const fn default_links_capacity() -> usize {
    200
}

const fn default_max_attempts() -> u32 {
    8
}

const fn default_retry_backoff_ms() -> u64 {
    50
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

const fn default_enqueue_attempts() -> u32 {
    3
}

const fn default_repair_interval_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = load_config(&dir.path().join("plait.toml")).expect("load should succeed");
        assert_eq!(cfg, PlaitConfig::default());
        assert_eq!(cfg.node.replica.receive_capacity, 20);
        assert_eq!(cfg.node.replica.sync_capacity, 20);
        assert_eq!(cfg.node.replica.links_capacity, 200);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plait.toml");
        std::fs::write(
            &path,
            r"
[node]
subscriber_capacity = 8

[node.replica]
links_capacity = 1000
repair_interval_ms = 0
",
        )
        .expect("write config");

        let cfg = load_config(&path).expect("load should succeed");
        assert_eq!(cfg.node.subscriber_capacity, 8);
        assert_eq!(cfg.node.bootstrap_parallelism, 16);
        assert_eq!(cfg.node.replica.links_capacity, 1000);
        assert_eq!(cfg.node.replica.max_attempts, 8);
        assert!(cfg.node.replica.repair_interval().is_none());
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plait.toml");
        std::fs::write(&path, "[node\nbroken").expect("write config");

        let err = load_config(&path).expect_err("invalid toml");
        assert!(format!("{err:#}").contains("plait.toml"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = ReplicaConfig {
            retry_backoff_ms: 10,
            max_backoff_ms: 100,
            ..ReplicaConfig::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(10));
        assert_eq!(cfg.backoff(2), Duration::from_millis(20));
        assert_eq!(cfg.backoff(4), Duration::from_millis(80));
        assert_eq!(cfg.backoff(5), Duration::from_millis(100));
        assert_eq!(cfg.backoff(200), Duration::from_millis(100));
    }
}
