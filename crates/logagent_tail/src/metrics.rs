//! In-memory counters for the task manager and tail tasks.
//!
//! Lock-free atomics; the manager loop and every task thread write,
//! anybody may read a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Task lifecycle
    pub tasks_started: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub tasks_restarted: AtomicU64,
    pub tasks_joined: AtomicU64,
    pub init_failures: AtomicU64,

    // Reconciliation
    pub snapshots_applied: AtomicU64,

    // Data path
    pub lines_published: AtomicU64,
    pub publish_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_started: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            tasks_restarted: AtomicU64::new(0),
            tasks_joined: AtomicU64::new(0),
            init_failures: AtomicU64::new(0),
            snapshots_applied: AtomicU64::new(0),
            lines_published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_tasks_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_restarted(&self) {
        self.tasks_restarted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_joined(&self) {
        self.tasks_joined.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_init_failures(&self) {
        self.init_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_snapshots_applied(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_lines_published(&self) {
        self.lines_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_publish_errors(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_restarted: self.tasks_restarted.load(Ordering::Relaxed),
            tasks_joined: self.tasks_joined.load(Ordering::Relaxed),
            init_failures: self.init_failures.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            lines_published: self.lines_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP logagent_tasks_started_total Collection tasks started
# TYPE logagent_tasks_started_total counter
logagent_tasks_started_total {}

# HELP logagent_tasks_cancelled_total Collection tasks cancelled
# TYPE logagent_tasks_cancelled_total counter
logagent_tasks_cancelled_total {}

# HELP logagent_tasks_restarted_total Collection tasks restarted after a topic change
# TYPE logagent_tasks_restarted_total counter
logagent_tasks_restarted_total {}

# HELP logagent_tasks_joined_total Task threads joined after termination
# TYPE logagent_tasks_joined_total counter
logagent_tasks_joined_total {}

# HELP logagent_task_init_failures_total Entries skipped because task setup failed
# TYPE logagent_task_init_failures_total counter
logagent_task_init_failures_total {}

# HELP logagent_snapshots_applied_total Snapshots reconciled
# TYPE logagent_snapshots_applied_total counter
logagent_snapshots_applied_total {}

# HELP logagent_lines_published_total Lines handed to the bus
# TYPE logagent_lines_published_total counter
logagent_lines_published_total {}

# HELP logagent_publish_errors_total Lines the bus refused
# TYPE logagent_publish_errors_total counter
logagent_publish_errors_total {}
"#,
            s.tasks_started,
            s.tasks_cancelled,
            s.tasks_restarted,
            s.tasks_joined,
            s.init_failures,
            s.snapshots_applied,
            s.lines_published,
            s.publish_errors,
        )
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_started: u64,
    pub tasks_cancelled: u64,
    pub tasks_restarted: u64,
    pub tasks_joined: u64,
    pub init_failures: u64,
    pub snapshots_applied: u64,
    pub lines_published: u64,
    pub publish_errors: u64,
}

impl MetricsSnapshot {
    /// Tasks started but not yet cancelled.
    pub fn tasks_live(&self) -> u64 {
        self.tasks_started.saturating_sub(self.tasks_cancelled)
    }

    pub fn summary(&self) -> String {
        format!(
            "Tasks: {} started, {} cancelled, {} restarted, {} joined, {} init failures | \
             Snapshots: {} applied | Lines: {} published, {} refused",
            self.tasks_started,
            self.tasks_cancelled,
            self.tasks_restarted,
            self.tasks_joined,
            self.init_failures,
            self.snapshots_applied,
            self.lines_published,
            self.publish_errors,
        )
    }
}
