//! Task Manager
//!
//! Converges the set of running collection tasks onto the latest snapshot.
//!
//! Design principles:
//! - One loop task owns the task map; nothing else can touch it
//! - Snapshots are handed over one at a time through a single-slot channel;
//!   `submit` returns once the loop has taken the snapshot, not when it is applied
//! - A path present in both old and new snapshot keeps its task instance
//! - Removed tasks are cancelled and forgotten immediately; their threads are
//!   reaped in the background and joined on shutdown
//! - A failing entry is logged and skipped, it never aborts a reconciliation
//! - `initialize()` may block on file I/O, so it runs on the blocking pool;
//!   the loop awaits it and stays the only writer of the task map

use crate::error::{ManagerError, TaskError};
use crate::metrics::METRICS;
use crate::task::{CollectionTask, TaskFactory};
use logagent_protocol::{normalize_snapshot, CollectEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do when a running path shows up with a different topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicChangePolicy {
    /// Leave the running task (and its old topic) alone.
    #[default]
    Keep,
    /// Cancel the running task and start a new one with the new topic.
    Restart,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub topic_change: TopicChangePolicy,
}

/// Identifies one task instance. A restarted path gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTaskInfo {
    pub id: TaskId,
    pub path: String,
    pub topic: String,
}

/// What one reconciliation step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: usize,
    /// Paths whose task failed to initialize and were skipped.
    pub failed: Vec<String>,
    pub duplicate_paths: Vec<String>,
    pub invalid: usize,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.restarted.is_empty()
            && self.failed.is_empty()
    }
}

/// Read-only picture of the manager, published after every step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSetView {
    /// Snapshots received through the handoff and applied (the initial batch is not counted).
    pub applied_snapshots: u64,
    /// Live tasks sorted by path.
    pub tasks: Vec<LiveTaskInfo>,
    /// Last applied desired state, after normalization.
    pub desired: Vec<CollectEntry>,
    pub last_outcome: ReconcileOutcome,
}

impl TaskSetView {
    pub fn paths(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.path.as_str()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&LiveTaskInfo> {
        self.tasks.iter().find(|t| t.path == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks still live when shutdown began.
    pub cancelled: usize,
    /// Task threads joined over the manager's lifetime.
    pub joined: usize,
    /// Task threads that ended in a panic over the manager's lifetime.
    pub panicked: usize,
}

#[derive(Debug)]
struct SnapshotHandoff {
    entries: Vec<CollectEntry>,
    accepted: oneshot::Sender<()>,
    applied: Option<oneshot::Sender<TaskSetView>>,
}

/// Submit-only capability. Cheap to clone, hand it to config watchers.
#[derive(Debug, Clone)]
pub struct SnapshotSender {
    tx: mpsc::Sender<SnapshotHandoff>,
}

impl SnapshotSender {
    /// Hand a full replacement snapshot to the manager.
    ///
    /// Waits until the manager loop has taken it; a snapshot still being
    /// applied holds later submitters back.
    pub async fn submit(&self, entries: Vec<CollectEntry>) -> Result<(), ManagerError> {
        let (accepted, accepted_rx) = oneshot::channel();
        let handoff = SnapshotHandoff {
            entries,
            accepted,
            applied: None,
        };
        self.tx.send(handoff).await.map_err(|_| ManagerError::Stopped)?;
        accepted_rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Like [`submit`](Self::submit), then waits for the reconciliation to finish.
    pub async fn apply(&self, entries: Vec<CollectEntry>) -> Result<TaskSetView, ManagerError> {
        let (accepted, _accepted_rx) = oneshot::channel();
        let (applied, applied_rx) = oneshot::channel();
        let handoff = SnapshotHandoff {
            entries,
            accepted,
            applied: Some(applied),
        };
        self.tx.send(handoff).await.map_err(|_| ManagerError::Stopped)?;
        applied_rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// [`submit`](Self::submit) for producers living outside the runtime.
    /// Panics if called from within an async context.
    pub fn blocking_submit(&self, entries: Vec<CollectEntry>) -> Result<(), ManagerError> {
        let (accepted, accepted_rx) = oneshot::channel();
        let handoff = SnapshotHandoff {
            entries,
            accepted,
            applied: None,
        };
        self.tx
            .blocking_send(handoff)
            .map_err(|_| ManagerError::Stopped)?;
        accepted_rx.blocking_recv().map_err(|_| ManagerError::Stopped)
    }
}

/// Handle for controlling a running task manager.
///
/// Dropping it without calling [`shutdown`](Self::shutdown) also stops the
/// manager; task threads are then joined in the background.
#[derive(Debug)]
pub struct TaskManagerHandle {
    snapshots: SnapshotSender,
    shutdown_tx: Option<oneshot::Sender<()>>,
    view_rx: watch::Receiver<TaskSetView>,
    join_handle: JoinHandle<ShutdownReport>,
}

impl TaskManagerHandle {
    pub async fn submit_snapshot(&self, entries: Vec<CollectEntry>) -> Result<(), ManagerError> {
        self.snapshots.submit(entries).await
    }

    pub async fn apply_snapshot(
        &self,
        entries: Vec<CollectEntry>,
    ) -> Result<TaskSetView, ManagerError> {
        self.snapshots.apply(entries).await
    }

    pub fn sender(&self) -> SnapshotSender {
        self.snapshots.clone()
    }

    pub fn view(&self) -> TaskSetView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSetView> {
        self.view_rx.clone()
    }

    /// Wait until at least `count` submitted snapshots have been applied.
    pub async fn wait_for_applied(&self, count: u64) -> Result<TaskSetView, ManagerError> {
        let mut rx = self.view_rx.clone();
        let view = rx
            .wait_for(|view| view.applied_snapshots >= count)
            .await
            .map_err(|_| ManagerError::Stopped)?;
        Ok((*view).clone())
    }

    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }

    /// Stop the loop, cancel every task and wait for all task threads to exit.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, ManagerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(self.join_handle.await?)
    }
}

struct LiveTask<T> {
    id: TaskId,
    task: Arc<T>,
    thread: thread::JoinHandle<()>,
}

/// A cancelled task whose thread may still be running.
struct RetiredTask {
    id: TaskId,
    path: String,
    thread: thread::JoinHandle<()>,
}

enum LoopEvent {
    Snapshot(SnapshotHandoff),
    Shutdown,
}

pub struct TaskManager<F: TaskFactory> {
    config: ManagerConfig,
    factory: F,
    tasks: HashMap<String, LiveTask<F::Task>>,
    desired: Vec<CollectEntry>,
    retiring: Vec<RetiredTask>,
    next_id: u64,
    applied: u64,
    joined: usize,
    panicked: usize,
    snapshot_rx: mpsc::Receiver<SnapshotHandoff>,
    shutdown_rx: oneshot::Receiver<()>,
    view_tx: watch::Sender<TaskSetView>,
}

impl<F: TaskFactory> TaskManager<F> {
    /// Start tasks for `initial` and spawn the reconciliation loop.
    ///
    /// Returns once the initial batch is live. Entries that fail to initialize
    /// are logged and skipped. The only error is the absence of a tokio
    /// runtime to host the loop.
    pub async fn start(
        factory: F,
        config: ManagerConfig,
        initial: Vec<CollectEntry>,
    ) -> Result<TaskManagerHandle, ManagerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (view_tx, view_rx) = watch::channel(TaskSetView::default());

        let mut manager = Self {
            config,
            factory,
            tasks: HashMap::with_capacity(initial.len()),
            desired: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
            applied: 0,
            joined: 0,
            panicked: 0,
            snapshot_rx,
            shutdown_rx,
            view_tx,
        };

        let outcome = manager.reconcile(initial).await;
        manager.log_outcome("initial", &outcome);
        manager.publish_view(outcome);

        let join_handle = runtime.spawn(manager.run());

        Ok(TaskManagerHandle {
            snapshots: SnapshotSender { tx: snapshot_tx },
            shutdown_tx: Some(shutdown_tx),
            view_rx,
            join_handle,
        })
    }

    async fn run(mut self) -> ShutdownReport {
        info!(tasks = self.tasks.len(), "Task manager waiting for snapshots");

        loop {
            self.reap_retired();

            let event = tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => LoopEvent::Shutdown,

                handoff = self.snapshot_rx.recv() => match handoff {
                    Some(handoff) => LoopEvent::Snapshot(handoff),
                    None => LoopEvent::Shutdown,
                },
            };

            match event {
                LoopEvent::Snapshot(handoff) => {
                    // Receiver gone just means the submitter stopped waiting.
                    let _ = handoff.accepted.send(());
                    debug!(entries = handoff.entries.len(), "Received new snapshot");

                    let outcome = self.reconcile(handoff.entries).await;
                    self.applied += 1;
                    METRICS.inc_snapshots_applied();
                    self.log_outcome("update", &outcome);
                    let view = self.publish_view(outcome);

                    if let Some(applied) = handoff.applied {
                        let _ = applied.send(view);
                    }
                }
                LoopEvent::Shutdown => break,
            }
        }

        self.stop_all().await
    }

    /// One reconciliation step: removals, then additions and topic changes.
    async fn reconcile(&mut self, entries: Vec<CollectEntry>) -> ReconcileOutcome {
        let snapshot = normalize_snapshot(entries);
        let mut outcome = ReconcileOutcome {
            duplicate_paths: snapshot.duplicate_paths.clone(),
            invalid: snapshot.invalid.len(),
            ..ReconcileOutcome::default()
        };

        for path in &snapshot.duplicate_paths {
            warn!(path = %path, "Duplicate path in snapshot, last entry wins");
        }
        for entry in &snapshot.invalid {
            warn!(path = %entry.path, topic = %entry.topic, "Ignoring entry with blank path or topic");
        }

        let desired: HashSet<&str> = snapshot.entries.iter().map(|e| e.path.as_str()).collect();
        let mut stale: Vec<String> = self
            .tasks
            .keys()
            .filter(|path| !desired.contains(path.as_str()))
            .cloned()
            .collect();
        stale.sort();

        for path in stale {
            if let Some(id) = self.retire(&path) {
                info!(path = %path, task = %id, "Stopped collection task");
                outcome.stopped.push(path);
            }
        }

        for entry in &snapshot.entries {
            let running_topic = self
                .tasks
                .get(&entry.path)
                .map(|live| live.task.topic().to_string());

            match running_topic {
                Some(topic) if topic == entry.topic => outcome.unchanged += 1,
                Some(topic) => match self.config.topic_change {
                    TopicChangePolicy::Keep => {
                        warn!(
                            path = %entry.path,
                            running_topic = %topic,
                            desired_topic = %entry.topic,
                            "Topic changed for a running path, keeping the existing task"
                        );
                        outcome.unchanged += 1;
                    }
                    TopicChangePolicy::Restart => {
                        self.retire(&entry.path);
                        match self.start_task(entry).await {
                            Ok(id) => {
                                METRICS.inc_tasks_restarted();
                                info!(path = %entry.path, old_topic = %topic, topic = %entry.topic, task = %id, "Restarted collection task");
                                outcome.restarted.push(entry.path.clone());
                            }
                            Err(e) => self.record_failure(e, &mut outcome),
                        }
                    }
                },
                None => match self.start_task(entry).await {
                    Ok(id) => {
                        info!(path = %entry.path, topic = %entry.topic, task = %id, "Started collection task");
                        outcome.started.push(entry.path.clone());
                    }
                    Err(e) => self.record_failure(e, &mut outcome),
                },
            }
        }

        self.desired = snapshot.entries;
        outcome
    }

    async fn start_task(&mut self, entry: &CollectEntry) -> Result<TaskId, TaskError> {
        let task = self.factory.create(entry);
        let task = tokio::task::spawn_blocking(move || task.initialize().map(|()| task))
            .await
            .map_err(|e| TaskError::Init {
                path: entry.path.clone(),
                message: e.to_string(),
            })??;

        let task = Arc::new(task);
        let id = self.next_task_id();
        let runner = Arc::clone(&task);
        let thread = thread::Builder::new()
            .name(format!("tail-{}", id.0))
            .spawn(move || runner.run())
            .map_err(|source| {
                task.cancel();
                TaskError::Spawn {
                    path: entry.path.clone(),
                    source,
                }
            })?;

        METRICS.inc_tasks_started();
        self.tasks
            .insert(entry.path.clone(), LiveTask { id, task, thread });
        Ok(id)
    }

    fn record_failure(&self, err: TaskError, outcome: &mut ReconcileOutcome) {
        METRICS.inc_init_failures();
        error!(path = %err.path(), error = %err, "Failed to start collection task, skipping entry");
        outcome.failed.push(err.path().to_string());
    }

    /// Cancel and unregister. Does not wait for the thread.
    fn retire(&mut self, path: &str) -> Option<TaskId> {
        let live = self.tasks.remove(path)?;
        live.task.cancel();
        METRICS.inc_tasks_cancelled();
        self.retiring.push(RetiredTask {
            id: live.id,
            path: path.to_string(),
            thread: live.thread,
        });
        Some(live.id)
    }

    /// Join retired threads that already exited.
    fn reap_retired(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|retired| retired.thread.is_finished());
        self.retiring = running;

        for retired in finished {
            debug!(path = %retired.path, task = %retired.id, "Reaped task thread");
            self.account_join(join_retired(retired));
        }
    }

    fn account_join(&mut self, panicked: bool) {
        self.joined += 1;
        METRICS.inc_tasks_joined();
        if panicked {
            self.panicked += 1;
        }
    }

    async fn stop_all(mut self) -> ShutdownReport {
        let mut paths: Vec<String> = self.tasks.keys().cloned().collect();
        paths.sort();
        let cancelled = paths.len();
        for path in &paths {
            self.retire(path);
        }
        self.publish_view(ReconcileOutcome {
            stopped: paths,
            ..ReconcileOutcome::default()
        });

        let retiring = std::mem::take(&mut self.retiring);
        info!(cancelled, waiting = retiring.len(), "Task manager stopping, joining task threads");

        match tokio::task::spawn_blocking(move || {
            retiring.into_iter().map(join_retired).collect::<Vec<_>>()
        })
        .await
        {
            Ok(results) => {
                for panicked in results {
                    self.account_join(panicked);
                }
            }
            Err(e) => error!(error = %e, "Failed to join task threads"),
        }

        let report = ShutdownReport {
            cancelled,
            joined: self.joined,
            panicked: self.panicked,
        };
        info!(
            cancelled = report.cancelled,
            joined = report.joined,
            panicked = report.panicked,
            "Task manager stopped"
        );
        report
    }

    fn next_task_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    fn log_outcome(&self, label: &str, outcome: &ReconcileOutcome) {
        if outcome.is_noop() {
            debug!(snapshot = label, live = self.tasks.len(), "Snapshot changed nothing");
            return;
        }
        info!(
            snapshot = label,
            started = outcome.started.len(),
            stopped = outcome.stopped.len(),
            restarted = outcome.restarted.len(),
            unchanged = outcome.unchanged,
            failed = outcome.failed.len(),
            live = self.tasks.len(),
            "Reconciled collection tasks"
        );
    }

    fn publish_view(&self, last_outcome: ReconcileOutcome) -> TaskSetView {
        let mut tasks: Vec<LiveTaskInfo> = self
            .tasks
            .iter()
            .map(|(path, live)| LiveTaskInfo {
                id: live.id,
                path: path.clone(),
                topic: live.task.topic().to_string(),
            })
            .collect();
        tasks.sort_by(|a, b| a.path.cmp(&b.path));

        let view = TaskSetView {
            applied_snapshots: self.applied,
            tasks,
            desired: self.desired.clone(),
            last_outcome,
        };
        self.view_tx.send_replace(view.clone());
        view
    }
}

/// Returns true when the thread ended in a panic.
fn join_retired(retired: RetiredTask) -> bool {
    match retired.thread.join() {
        Ok(()) => false,
        Err(_) => {
            error!(path = %retired.path, task = %retired.id, "Collection task panicked");
            true
        }
    }
}
