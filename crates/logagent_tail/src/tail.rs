//! File tailing collection task.
//!
//! Polls the file for appended bytes, splits them into lines and publishes
//! every non-blank line. Handles the usual log file lifecycle:
//! - truncation (size drops below our offset): restart from byte 0
//! - rotation (path now names another inode, unix only): reopen, read from the start
//! - removal: wait for the path to reappear

use crate::cancel::CancellationToken;
use crate::error::{PublishError, TaskError};
use crate::metrics::METRICS;
use crate::publisher::Publisher;
use crate::task::{CollectionTask, TaskFactory};
use logagent_protocol::defaults::DEFAULT_TAIL_POLL_INTERVAL_MS;
use logagent_protocol::{CollectEntry, LogMessage};
use std::fs::{self, File, Metadata};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lines read per poll before cancellation is re-checked.
const MAX_LINES_PER_POLL: usize = 1024;

/// A line without a newline that grows past this is published as-is.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailConfig {
    pub poll_interval: Duration,
    /// Fail `initialize()` when the file does not exist yet.
    pub must_exist: bool,
    /// Ship the existing content instead of starting at the end.
    pub from_beginning: bool,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_TAIL_POLL_INTERVAL_MS),
            must_exist: true,
            from_beginning: false,
        }
    }
}

pub struct TailTask {
    path: String,
    topic: String,
    config: TailConfig,
    publisher: Arc<dyn Publisher>,
    token: CancellationToken,
    initialized: AtomicBool,
    cursor: Mutex<Option<TailCursor>>,
}

impl TailTask {
    pub fn new(
        path: impl Into<String>,
        topic: impl Into<String>,
        config: TailConfig,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            path: path.into(),
            topic: topic.into(),
            config,
            publisher,
            token: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            cursor: Mutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn open_error(&self, source: io::Error) -> TaskError {
        TaskError::Open {
            path: self.path.clone(),
            source,
        }
    }

    fn take_cursor(&self) -> Option<TailCursor> {
        match self.cursor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn publish_line(&self, line: String) -> Result<(), PublishError> {
        let msg = LogMessage::new(self.topic.clone(), self.path.clone(), line);
        match self.publisher.publish(msg) {
            Ok(()) => {
                METRICS.inc_lines_published();
                Ok(())
            }
            Err(e) => {
                METRICS.inc_publish_errors();
                Err(e)
            }
        }
    }
}

impl CollectionTask for TailTask {
    fn path(&self) -> &str {
        &self.path
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn initialize(&self) -> Result<(), TaskError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyInitialized {
                path: self.path.clone(),
            });
        }

        let path = Path::new(&self.path);
        let cursor = match File::open(path) {
            Ok(file) => {
                let meta = file.metadata().map_err(|e| self.open_error(e))?;
                if !meta.is_file() {
                    return Err(TaskError::NotAFile {
                        path: self.path.clone(),
                    });
                }
                let start = if self.config.from_beginning {
                    SeekFrom::Start(0)
                } else {
                    SeekFrom::End(0)
                };
                TailCursor::open(file, &meta, start).map_err(|e| self.open_error(e))?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.config.must_exist => {
                debug!(path = %self.path, "File not present yet, waiting for it to appear");
                TailCursor::waiting()
            }
            Err(e) => return Err(self.open_error(e)),
        };

        match self.cursor.lock() {
            Ok(mut guard) => *guard = Some(cursor),
            Err(poisoned) => *poisoned.into_inner() = Some(cursor),
        }
        Ok(())
    }

    fn run(&self) {
        let Some(mut cursor) = self.take_cursor() else {
            warn!(path = %self.path, "Tail task run without a successful initialize");
            return;
        };
        info!(path = %self.path, topic = %self.topic, offset = cursor.offset, "Tailing");

        let path = Path::new(&self.path);
        while !self.token.is_cancelled() {
            let lines = match cursor.read_lines(path, MAX_LINES_PER_POLL) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(path = %self.path, error = %e, "Read failed, retrying");
                    Vec::new()
                }
            };

            if lines.is_empty() {
                if !self.token.sleep_unless_cancelled(self.config.poll_interval) {
                    break;
                }
                continue;
            }

            for line in lines {
                if let Err(e) = self.publish_line(line) {
                    warn!(path = %self.path, topic = %self.topic, error = %e, "Bus refused line, stopping tail");
                    return;
                }
            }
        }

        debug!(path = %self.path, offset = cursor.offset, "Tail task stopped");
    }

    fn cancel(&self) {
        if self.token.cancel() {
            debug!(path = %self.path, "Tail task cancellation requested");
        }
    }
}

/// Identity of the file behind a path, used to notice rotation.
#[cfg(unix)]
fn file_identity(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

/// Read position within the tailed file. Owned by the running thread.
struct TailCursor {
    /// None while the file does not exist.
    reader: Option<BufReader<File>>,
    identity: Option<(u64, u64)>,
    offset: u64,
    pending: Vec<u8>,
}

impl TailCursor {
    fn open(mut file: File, meta: &Metadata, start: SeekFrom) -> io::Result<Self> {
        let offset = file.seek(start)?;
        Ok(Self {
            reader: Some(BufReader::new(file)),
            identity: file_identity(meta),
            offset,
            pending: Vec::new(),
        })
    }

    fn waiting() -> Self {
        Self {
            reader: None,
            identity: None,
            offset: 0,
            pending: Vec::new(),
        }
    }

    /// Read up to `max` complete, non-blank lines.
    fn read_lines(&mut self, path: &Path, max: usize) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        if self.reader.is_none() && !self.reopen(path)? {
            return Ok(lines);
        }

        if let Some(reader) = self.reader.as_mut() {
            while lines.len() < max {
                let n = reader.read_until(b'\n', &mut self.pending)?;
                if n == 0 {
                    break;
                }
                self.offset += n as u64;
                if self.pending.last() == Some(&b'\n') || self.pending.len() >= MAX_LINE_BYTES {
                    if let Some(line) = take_line(&mut self.pending) {
                        lines.push(line);
                    }
                }
            }
        }

        if lines.is_empty() {
            self.check_replaced(path)?;
        }
        Ok(lines)
    }

    /// Compare what the path names now against what we are reading.
    fn check_replaced(&mut self, path: &Path) -> io::Result<()> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.reader.take().is_some() {
                    info!(path = %path.display(), "File removed, waiting for it to reappear");
                }
                self.reset();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let identity = file_identity(&meta);
        if identity.is_some() && identity != self.identity {
            info!(path = %path.display(), "File rotated, reopening");
            self.reader = None;
            self.reset();
            self.reopen(path)?;
        } else if meta.len() < self.offset {
            info!(path = %path.display(), size = meta.len(), offset = self.offset, "File truncated, reading from start");
            if let Some(reader) = self.reader.as_mut() {
                reader.seek(SeekFrom::Start(0))?;
            }
            self.reset();
        }
        Ok(())
    }

    /// Open the file at offset 0. Ok(false) when it is still missing.
    fn reopen(&mut self, path: &Path) -> io::Result<bool> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let meta = file.metadata()?;
        let cursor = TailCursor::open(file, &meta, SeekFrom::Start(0))?;
        *self = cursor;
        debug!(path = %path.display(), "Opened file");
        Ok(true)
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.pending.clear();
    }
}

/// Drain `pending` into a line without its terminator. None for blank lines.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let mut end = pending.len();
    while end > 0 && matches!(pending[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&pending[..end]).into_owned();
    pending.clear();
    if line.trim().is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Builds [`TailTask`]s that all publish into the same bus.
#[derive(Clone)]
pub struct TailTaskFactory {
    config: TailConfig,
    publisher: Arc<dyn Publisher>,
}

impl TailTaskFactory {
    pub fn new(config: TailConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self { config, publisher }
    }

    pub fn config(&self) -> &TailConfig {
        &self.config
    }
}

impl TaskFactory for TailTaskFactory {
    type Task = TailTask;

    fn create(&self, entry: &CollectEntry) -> TailTask {
        TailTask::new(
            entry.path.clone(),
            entry.topic.clone(),
            self.config.clone(),
            Arc::clone(&self.publisher),
        )
    }
}
