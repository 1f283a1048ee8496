//! Tracing setup for the agent binary: a size-rotated log file plus stderr.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "logagent=info,logagent_tail=info,logagent_sinks=info";
const VERBOSE_LOG_FILTER: &str = "logagent=debug,logagent_tail=debug,logagent_sinks=debug";
const RETENTION: Retention = Retention {
    generations: 5,
    max_bytes: 10 * 1024 * 1024,
};

/// Logging configuration for the agent binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Console gets debug output for the agent crates.
    pub verbose: bool,
    /// Overrides `~/.logagent/logs`.
    pub log_dir: Option<PathBuf>,
}

fn env_or_default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize tracing with a rolling file writer and stderr output.
///
/// `RUST_LOG` overrides the file filter; the console follows it unless
/// `verbose` is set.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.log_dir {
        Some(dir) => dir,
        None => logagent_protocol::paths::default_logs_dir(),
    };
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;

    let file_writer = RotatingLog::open(log_dir.clone(), config.app_name, RETENTION)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter = env_or_default_filter();
    let console_filter = if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        env_or_default_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    tracing::debug!(log_dir = %log_dir.display(), "Logging initialized");
    Ok(())
}

/// How much history the log file keeps.
#[derive(Debug, Clone, Copy)]
struct Retention {
    /// Files kept, the live one included.
    generations: usize,
    /// The live file is rotated before it would grow past this.
    max_bytes: u64,
}

/// `<stem>.log` is live, `<stem>.log.1` the newest rotated generation.
struct LogFiles {
    dir: PathBuf,
    stem: String,
}

impl LogFiles {
    fn live(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn generation(&self, n: usize) -> PathBuf {
        if n == 0 {
            return self.live();
        }
        self.dir.join(format!("{}.log.{}", self.stem, n))
    }

    fn open_live(&self) -> io::Result<LiveFile> {
        let file = OpenOptions::new().create(true).append(true).open(self.live())?;
        let len = file.metadata()?.len();
        Ok(LiveFile { file, len })
    }

    /// Move every generation one slot up. The last slot is overwritten.
    fn shift(&self, generations: usize) -> io::Result<()> {
        if generations <= 1 {
            return ignore_missing(fs::remove_file(self.live()));
        }
        for n in (1..generations).rev() {
            ignore_missing(fs::rename(self.generation(n - 1), self.generation(n)))?;
        }
        Ok(())
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

struct LiveFile {
    file: File,
    len: u64,
}

/// Size-rotated log file shared by every event the file layer writes.
struct RotatingLog {
    files: LogFiles,
    retention: Retention,
    // None only after a failed reopen; the next write retries.
    live: Mutex<Option<LiveFile>>,
}

impl RotatingLog {
    fn open(dir: PathBuf, name: &str, retention: Retention) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let retention = Retention {
            generations: retention.generations.max(1),
            ..retention
        };
        let files = LogFiles {
            dir,
            stem: sanitize_name(name),
        };
        let mut live = files.open_live()?;
        if live.len > retention.max_bytes {
            drop(live);
            files.shift(retention.generations)?;
            live = files.open_live()?;
        }
        Ok(Self {
            files,
            retention,
            live: Mutex::new(Some(live)),
        })
    }

    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self
            .live
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;

        let full = slot.as_ref().is_some_and(|live| {
            live.len > 0 && live.len + buf.len() as u64 > self.retention.max_bytes
        });
        if full {
            // Closed before renaming; some platforms refuse to move an open file.
            drop(slot.take());
            self.files.shift(self.retention.generations)?;
        }

        if slot.is_none() {
            *slot = Some(self.files.open_live()?);
        }
        let live = slot
            .as_mut()
            .ok_or_else(|| io::Error::other("log file unavailable"))?;
        let written = live.file.write(buf)?;
        live.len += written as u64;
        Ok(written)
    }

    fn sync(&self) -> io::Result<()> {
        let mut slot = self
            .live
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        match slot.as_mut() {
            Some(live) => live.file.flush(),
            None => Ok(()),
        }
    }
}

impl Write for &RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingLog {
    type Writer = &'a RotatingLog;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
