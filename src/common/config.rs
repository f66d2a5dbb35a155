//! Configuration for tpckv components

use crate::common::utils::human_duration;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "TPCKV_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Role (coordinator, replica or client)
    #[serde(default = "default_role")]
    pub role: NodeRole,

    /// Coordinator-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Replica-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica: Option<ReplicaConfig>,

    /// Client-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "tpckv-1".to_string()
}

fn default_role() -> NodeRole {
    NodeRole::Client
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            role: default_role(),
            coordinator: None,
            replica: None,
            client: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `tpckv.toml` (or the file named by `TPCKV_CONFIG`)
    /// layered under `TPCKV_*` environment variables. Missing files are fine.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "tpckv".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("TPCKV")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a node unusable.
    pub fn validate(&self) -> Result<()> {
        if let Some(coord) = &self.coordinator {
            coord.validate()?;
        }
        if let Some(replica) = &self.replica {
            replica.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Replica,
    Client,
}

/// WAL durability policy for the participant log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// Flush and fsync every entry before replying
    #[default]
    Always,
    /// Flush to the OS, let it decide when to hit disk
    Interval,
    /// Leave entries buffered (tests only)
    Never,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for client traffic
    pub bind_addr: SocketAddr,

    /// Bind address for replica registration
    pub registration_addr: SocketAddr,

    /// Number of replicas that must register before client traffic is accepted
    #[serde(default = "default_expected_replicas")]
    pub expected_replicas: usize,

    /// Read cache capacity (entries)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Concurrent client handlers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent registration handlers
    #[serde(default = "default_registration_workers")]
    pub registration_workers: usize,

    /// Deadline for each phase-1 vote request
    #[serde(default = "default_phase1_timeout", with = "human_duration")]
    pub phase1_timeout: Duration,

    /// Deadline for each phase-2 attempt (retried until acked)
    #[serde(default = "default_phase2_timeout", with = "human_duration")]
    pub phase2_timeout: Duration,

    /// First back-off between phase-2 attempts
    #[serde(default = "default_retry_interval", with = "human_duration")]
    pub retry_interval: Duration,

    /// Upper bound for phase-2 back-off
    #[serde(default = "default_max_retry_interval", with = "human_duration")]
    pub max_retry_interval: Duration,

    /// Deadline for replica reads
    #[serde(default = "default_read_timeout", with = "human_duration")]
    pub read_timeout: Duration,
}

fn default_expected_replicas() -> usize {
    2
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_workers() -> usize {
    10
}
fn default_registration_workers() -> usize {
    1
}
fn default_phase1_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_phase2_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_retry_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_max_retry_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            registration_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            expected_replicas: default_expected_replicas(),
            cache_capacity: default_cache_capacity(),
            workers: default_workers(),
            registration_workers: default_registration_workers(),
            phase1_timeout: default_phase1_timeout(),
            phase2_timeout: default_phase2_timeout(),
            retry_interval: default_retry_interval(),
            max_retry_interval: default_max_retry_interval(),
            read_timeout: default_read_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(Error::InvalidConfig("cache_capacity must be at least 1".into()));
        }
        if self.workers == 0 || self.registration_workers == 0 {
            return Err(Error::InvalidConfig("worker counts must be at least 1".into()));
        }
        if self.expected_replicas == 0 {
            return Err(Error::InvalidConfig(
                "expected_replicas must be at least 1".into(),
            ));
        }
        if self.phase1_timeout.is_zero() {
            return Err(Error::InvalidConfig("phase1_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// 64-bit ring identifier
    pub node_id: u64,

    /// Bind address for coordinator traffic
    pub bind_addr: SocketAddr,

    /// Host name announced to the coordinator
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Coordinator registration endpoint
    pub coordinator_addr: String,

    /// Participant log file
    pub log_path: PathBuf,

    /// Log durability
    #[serde(default)]
    pub wal_sync: WalSyncPolicy,

    /// Concurrent request handlers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long a ready request waits for the previous operation to be decided
    #[serde(default = "default_ready_wait", with = "human_duration")]
    pub ready_wait: Duration,
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ready_wait() -> Duration {
    Duration::from_secs(3)
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            advertise_host: default_advertise_host(),
            coordinator_addr: "127.0.0.1:9090".to_string(),
            log_path: PathBuf::from("./replica-data/participant.log"),
            wal_sync: WalSyncPolicy::Always,
            workers: default_workers(),
            ready_wait: default_ready_wait(),
        }
    }
}

impl ReplicaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if self.advertise_host.contains(['@', ':']) {
            return Err(Error::InvalidConfig(format!(
                "advertise_host may not contain '@' or ':': {}",
                self.advertise_host
            )));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Coordinator client endpoint
    #[serde(default = "default_coordinator_addr")]
    pub coordinator_addr: String,

    /// Request deadline
    #[serde(default = "default_request_timeout", with = "human_duration")]
    pub request_timeout: Duration,

    /// Base64 master key for value encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

fn default_coordinator_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: default_coordinator_addr(),
            request_timeout: default_request_timeout(),
            encryption_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_defaults_are_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_cache_rejected() {
        let config = CoordinatorConfig {
            cache_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_replica_host_rejected() {
        let config = ReplicaConfig {
            advertise_host: "bad@host".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml_durations() {
        let raw = r#"
            node_id = "coord-a"
            role = "coordinator"

            [coordinator]
            bind_addr = "127.0.0.1:8080"
            registration_addr = "127.0.0.1:9090"
            phase1_timeout = "250ms"
            retry_interval = "1s"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let coord = config.coordinator.unwrap();
        assert_eq!(config.role, NodeRole::Coordinator);
        assert_eq!(coord.phase1_timeout, Duration::from_millis(250));
        assert_eq!(coord.retry_interval, Duration::from_secs(1));
        assert_eq!(coord.cache_capacity, 1000);
    }
}
