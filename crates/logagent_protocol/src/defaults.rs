//! Canonical default values shared by the agent crates.

/// Per-host key under which the remote store keeps the collect snapshot.
/// `{ip}` is replaced with the agent's outbound address.
pub const DEFAULT_COLLECT_KEY_TEMPLATE: &str = "collect_log_{ip}_conf";
pub const COLLECT_KEY_IP_PLACEHOLDER: &str = "{ip}";
pub const DEFAULT_BUS_URI: &str = "stdout://";
pub const DEFAULT_BUS_CHANNEL_CAPACITY: usize = 10_000;
pub const DEFAULT_TAIL_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_REMOTE_WATCH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_CONFIG_FILE: &str = "logagent.toml";
