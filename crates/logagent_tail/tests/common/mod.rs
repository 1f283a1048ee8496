//! Scripted collection tasks for exercising the task manager.

#![allow(dead_code)]

use logagent_protocol::CollectEntry;
use logagent_tail::{CancellationToken, CollectionTask, TaskError, TaskFactory};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn entry(path: &str, topic: &str) -> CollectEntry {
    CollectEntry::new(path, topic)
}

/// What the test can observe about one task instance.
#[derive(Debug)]
pub struct TaskTrace {
    pub path: String,
    pub topic: String,
    pub cancels: AtomicUsize,
    pub running: AtomicBool,
    pub finished: AtomicBool,
}

impl TaskTrace {
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

pub struct MockTask {
    trace: Arc<TaskTrace>,
    token: CancellationToken,
    fail_init: bool,
    panic_on_run: bool,
    gate: Option<Arc<AtomicBool>>,
}

impl CollectionTask for MockTask {
    fn path(&self) -> &str {
        &self.trace.path
    }

    fn topic(&self) -> &str {
        &self.trace.topic
    }

    fn initialize(&self) -> Result<(), TaskError> {
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        if self.fail_init {
            return Err(TaskError::Init {
                path: self.trace.path.clone(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn run(&self) {
        self.trace.running.store(true, Ordering::SeqCst);
        if self.panic_on_run {
            self.trace.finished.store(true, Ordering::SeqCst);
            panic!("scripted panic for {}", self.trace.path);
        }
        while !self.token.is_cancelled() {
            std::thread::sleep(Duration::from_millis(2));
        }
        self.trace.finished.store(true, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.trace.cancels.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
    }
}

#[derive(Default)]
pub struct MockState {
    created: Mutex<Vec<Arc<TaskTrace>>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn fail_path(&self, path: &str) {
        self.state.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn heal_path(&self, path: &str) {
        self.state.failing.lock().unwrap().remove(path);
    }

    pub fn panic_path(&self, path: &str) {
        self.state.panicking.lock().unwrap().insert(path.to_string());
    }

    /// `initialize()` for `path` blocks until the returned flag is set.
    pub fn gate_path(&self, path: &str) -> Arc<AtomicBool> {
        let gate = Arc::new(AtomicBool::new(false));
        self.state
            .gates
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::clone(&gate));
        gate
    }

    /// Every instance ever created for `path`, oldest first.
    pub fn traces_for(&self, path: &str) -> Vec<Arc<TaskTrace>> {
        self.state
            .created
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.path == path)
            .cloned()
            .collect()
    }

    pub fn all_traces(&self) -> Vec<Arc<TaskTrace>> {
        self.state.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.state.created.lock().unwrap().len()
    }
}

impl TaskFactory for MockFactory {
    type Task = MockTask;

    fn create(&self, entry: &CollectEntry) -> MockTask {
        let trace = Arc::new(TaskTrace {
            path: entry.path.clone(),
            topic: entry.topic.clone(),
            cancels: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        self.state.created.lock().unwrap().push(Arc::clone(&trace));
        MockTask {
            trace,
            token: CancellationToken::new(),
            fail_init: self.state.failing.lock().unwrap().contains(&entry.path),
            panic_on_run: self.state.panicking.lock().unwrap().contains(&entry.path),
            gate: self.state.gates.lock().unwrap().get(&entry.path).cloned(),
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
