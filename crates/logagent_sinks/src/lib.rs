//! Bus side of the agent.
//!
//! Tail tasks push [`LogMessage`]s into a bounded channel. A single
//! forwarder drains that channel into one [`BusSink`] chosen by URI:
//! - `stdout://` writes one JSON object per line to standard output
//! - `file://<dir>` appends to `<dir>/<topic>.jsonl`, one file per topic

use logagent_protocol::LogMessage;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

mod forward;

pub use forward::{spawn_forwarder, ForwardStats};

/// Errors returned by sink parsing and writing.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink URI '{uri}' is invalid: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("Unsupported sink scheme: '{0}'")]
    UnsupportedScheme(String),
    #[error("Sink I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Supported bus URI schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkScheme {
    Stdout,
    File,
}

impl SinkScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkScheme::Stdout => "stdout",
            SinkScheme::File => "file",
        }
    }
}

impl FromStr for SinkScheme {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(SinkScheme::Stdout),
            "file" => Ok(SinkScheme::File),
            other => Err(SinkError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Parsed bus URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSpec {
    Stdout,
    File { dir: PathBuf },
}

impl SinkSpec {
    pub fn parse(uri: &str) -> SinkResult<Self> {
        let (scheme_str, rest) = uri.split_once("://").ok_or_else(|| SinkError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing scheme delimiter".to_string(),
        })?;

        match scheme_str.parse::<SinkScheme>()? {
            SinkScheme::Stdout => {
                if !rest.is_empty() {
                    return Err(SinkError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "stdout takes no path".to_string(),
                    });
                }
                Ok(SinkSpec::Stdout)
            }
            SinkScheme::File => {
                if rest.trim().is_empty() {
                    return Err(SinkError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "missing directory".to_string(),
                    });
                }
                Ok(SinkSpec::File {
                    dir: PathBuf::from(rest),
                })
            }
        }
    }

    pub fn scheme(&self) -> SinkScheme {
        match self {
            SinkSpec::Stdout => SinkScheme::Stdout,
            SinkSpec::File { .. } => SinkScheme::File,
        }
    }
}

/// Destination for collected lines. Driven from a single blocking thread.
pub trait BusSink: Send {
    fn write(&mut self, msg: &LogMessage) -> SinkResult<()>;
    fn flush(&mut self) -> SinkResult<()>;
}

pub struct StdoutSink {
    out: BufWriter<io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: BufWriter::new(io::stdout()),
        }
    }

    fn io_error(source: io::Error) -> SinkError {
        SinkError::Io {
            path: PathBuf::from("<stdout>"),
            source,
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BusSink for StdoutSink {
    fn write(&mut self, msg: &LogMessage) -> SinkResult<()> {
        serde_json::to_writer(&mut self.out, msg)?;
        self.out.write_all(b"\n").map_err(Self::io_error)
    }

    fn flush(&mut self) -> SinkResult<()> {
        self.out.flush().map_err(Self::io_error)
    }
}

/// One append-only JSON Lines file per topic.
pub struct FileSink {
    dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> SinkResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| SinkError::Io {
            path: dir.clone(),
            source,
        })?;
        info!(dir = %dir.display(), "File sink ready");
        Ok(Self {
            dir,
            writers: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds `topic`'s messages.
    pub fn topic_path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize_topic(topic)))
    }

    fn writer_for(&mut self, topic: &str) -> SinkResult<&mut BufWriter<File>> {
        let path = self.topic_path(topic);
        match self.writers.entry(topic.to_string()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|source| SinkError::Io {
                        path: path.clone(),
                        source,
                    })?;
                debug!(topic = %topic, path = %path.display(), "Opened topic file");
                Ok(slot.insert(BufWriter::new(file)))
            }
        }
    }
}

impl BusSink for FileSink {
    fn write(&mut self, msg: &LogMessage) -> SinkResult<()> {
        let writer = self.writer_for(&msg.topic)?;
        serde_json::to_writer(&mut *writer, msg)?;
        if let Err(source) = writer.write_all(b"\n") {
            return Err(SinkError::Io {
                path: self.topic_path(&msg.topic),
                source,
            });
        }
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        let mut first_err = None;
        for (topic, writer) in self.writers.iter_mut() {
            if let Err(source) = writer.flush() {
                warn!(topic = %topic, error = %source, "Flush failed");
                if first_err.is_none() {
                    first_err = Some(SinkError::Io {
                        path: self.dir.join(format!("{}.jsonl", sanitize_topic(topic))),
                        source,
                    });
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Build the sink a parsed URI names.
pub fn open_sink(spec: &SinkSpec) -> SinkResult<Box<dyn BusSink>> {
    match spec {
        SinkSpec::Stdout => Ok(Box::new(StdoutSink::new())),
        SinkSpec::File { dir } => Ok(Box::new(FileSink::new(dir.clone())?)),
    }
}

/// Topics become file names; keep them to a safe character set.
fn sanitize_topic(topic: &str) -> String {
    let cleaned: String = topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}
