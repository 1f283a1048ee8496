//! Log shipping agent.
//!
//! Tails the files named by this host's collect snapshot and forwards every
//! new line to the bus under the entry's topic. The snapshot comes from the
//! local config file or from a remote key that is polled for changes.

pub mod agent;
pub mod config;
pub mod net;
pub mod source;

pub use agent::{run, write_metrics_textfile, AgentReport, InitialSource};
pub use config::{AgentConfig, ConfigError, RemoteConfig, RemoteKind};
pub use source::{PollOutcome, RemoteSource, RemoteWatcher, SourceError};
