//! Shared data model for the log shipping agent.
//!
//! Everything that crosses a crate boundary lives here:
//!
//! ```text
//! ┌────────────────┐  snapshot    ┌────────────────┐  LogMessage  ┌────────────────┐
//! │ config source  │─────────────▶│  task manager  │─────────────▶│    bus sink    │
//! │ (local/remote) │ CollectEntry │  + tail tasks  │              │ (stdout/file)  │
//! └────────────────┘              └────────────────┘              └────────────────┘
//! ```
//!
//! - [`CollectEntry`]: one desired (path, topic) pair
//! - [`normalize_snapshot`]: the policy applied to every incoming snapshot
//! - [`LogMessage`]: one tailed line on its way to the bus

pub mod defaults;
pub mod entry;
pub mod error;
pub mod message;
pub mod paths;

pub use entry::{normalize_snapshot, parse_snapshot_json, CollectEntry, NormalizedSnapshot};
pub use error::{ProtocolError, Result};
pub use message::LogMessage;
