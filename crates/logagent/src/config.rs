//! Agent configuration file (TOML).

use logagent_protocol::defaults::{
    COLLECT_KEY_IP_PLACEHOLDER, DEFAULT_BUS_CHANNEL_CAPACITY, DEFAULT_BUS_URI,
    DEFAULT_COLLECT_KEY_TEMPLATE, DEFAULT_REMOTE_WATCH_INTERVAL_SECS, DEFAULT_SHUTDOWN_GRACE_SECS,
    DEFAULT_TAIL_POLL_INTERVAL_MS,
};
use logagent_protocol::CollectEntry;
use logagent_sinks::SinkSpec;
use logagent_tail::{ManagerConfig, TailConfig, TopicChangePolicy};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub tail: TailSection,

    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub metrics: MetricsSection,

    /// Where the per-host snapshot lives. Without it only `collect` is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,

    /// Local snapshot, used when no remote value exists.
    #[serde(default)]
    pub collect: Vec<CollectEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Overrides outbound address discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_uri")]
    pub uri: String,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_bus_uri() -> String {
    DEFAULT_BUS_URI.to_string()
}

fn default_channel_capacity() -> usize {
    DEFAULT_BUS_CHANNEL_CAPACITY
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: default_bus_uri(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_true")]
    pub must_exist: bool,

    #[serde(default)]
    pub from_beginning: bool,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_TAIL_POLL_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl Default for TailSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            must_exist: true,
            from_beginning: false,
        }
    }
}

impl TailSection {
    pub fn to_tail_config(&self) -> TailConfig {
        TailConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            must_exist: self.must_exist,
            from_beginning: self.from_beginning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(default)]
    pub topic_change: TopicChangePolicy,

    /// How long shutdown waits for tasks and the bus to drain.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            topic_change: TopicChangePolicy::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ManagerSection {
    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            topic_change: self.topic_change,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSection {
    /// Counters are written here in Prometheus text format on shutdown,
    /// for a node exporter textfile collector to pick up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub textfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// A directory used as a key/value store, one file per key.
    File,
    /// `GET <location>/<key>`.
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub kind: RemoteKind,

    pub location: String,

    /// May contain `{ip}`.
    #[serde(default = "default_collect_key")]
    pub key: String,

    #[serde(default = "default_remote_interval_secs")]
    pub interval_secs: u64,
}

fn default_collect_key() -> String {
    DEFAULT_COLLECT_KEY_TEMPLATE.to_string()
}

fn default_remote_interval_secs() -> u64 {
    DEFAULT_REMOTE_WATCH_INTERVAL_SECS
}

impl RemoteConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        SinkSpec::parse(&self.bus.uri).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.bus.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bus.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.tail.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tail.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(remote) = &self.remote {
            if remote.location.trim().is_empty() {
                return Err(ConfigError::Invalid("remote.location is empty".to_string()));
            }
            if remote.key.trim().is_empty() {
                return Err(ConfigError::Invalid("remote.key is empty".to_string()));
            }
            if remote.interval_secs == 0 {
                return Err(ConfigError::Invalid(
                    "remote.interval_secs must be greater than 0".to_string(),
                ));
            }
        }
        if let Some(bad) = self.collect.iter().find(|e| !e.is_valid()) {
            return Err(ConfigError::Invalid(format!(
                "collect entry needs both path and topic: {}",
                bad
            )));
        }
        Ok(())
    }

    /// Key of this host's snapshot in the remote store.
    pub fn collect_key(&self, ip: IpAddr) -> String {
        let template = self
            .remote
            .as_ref()
            .map(|r| r.key.as_str())
            .unwrap_or(DEFAULT_COLLECT_KEY_TEMPLATE);
        template.replace(COLLECT_KEY_IP_PLACEHOLDER, &ip.to_string())
    }
}
