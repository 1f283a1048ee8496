//! The contract between the task manager and a collection task.
//!
//! Lifecycle of a task, driven solely by the manager:
//!
//! ```text
//! create ──▶ initialize() ──ok──▶ run() on its own thread ──▶ cancel() ──▶ run() returns
//!                 │
//!                 └──err──▶ dropped, nothing scheduled
//! ```
//!
//! A cancelled task is never reused. A path that comes back gets a new task.

use crate::error::TaskError;
use logagent_protocol::CollectEntry;

pub trait CollectionTask: Send + Sync + 'static {
    /// Identity of the task. Stable for its whole lifetime.
    fn path(&self) -> &str;

    fn topic(&self) -> &str;

    /// One-shot setup before any background work is scheduled.
    fn initialize(&self) -> Result<(), TaskError>;

    /// Blocks the calling thread until cancellation is observed.
    fn run(&self);

    /// Request termination. `run()` returns at some later point.
    fn cancel(&self);
}

/// Builds a task for an entry. Construction itself never fails;
/// failures belong to [`CollectionTask::initialize`].
pub trait TaskFactory: Send + 'static {
    type Task: CollectionTask;

    fn create(&self, entry: &CollectEntry) -> Self::Task;
}
