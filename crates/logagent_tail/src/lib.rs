//! Collection tasks and the task manager that runs them.
//!
//! The [`TaskManager`] owns one [`CollectionTask`] per desired path and
//! converges that set onto every snapshot handed to it through a
//! [`SnapshotSender`]. [`TailTask`] is the production task: it follows a
//! file and publishes each new line through a [`Publisher`].

pub mod cancel;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod publisher;
pub mod tail;
pub mod task;

pub use cancel::CancellationToken;
pub use error::{ManagerError, PublishError, TaskError};
pub use manager::{
    LiveTaskInfo, ManagerConfig, ReconcileOutcome, ShutdownReport, SnapshotSender, TaskId,
    TaskManager, TaskManagerHandle, TaskSetView, TopicChangePolicy,
};
pub use metrics::METRICS;
pub use publisher::{ChannelPublisher, Publisher};
pub use tail::{TailConfig, TailTask, TailTaskFactory};
pub use task::{CollectionTask, TaskFactory};
