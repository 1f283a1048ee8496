//! Remote snapshot sources and the loop that feeds them to the task manager.
//!
//! A source maps this host's collect key to a JSON array of entries. The
//! watcher polls it and submits a snapshot only when the value changed since
//! the last submission. A missing key means "no opinion": the current task
//! set is left alone.

use crate::config::{RemoteConfig, RemoteKind};
use logagent_protocol::{parse_snapshot_json, CollectEntry, ProtocolError};
use logagent_tail::{ManagerError, SnapshotSender};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("Snapshot under '{key}' is malformed: {source}")]
    Payload {
        key: String,
        #[source]
        source: ProtocolError,
    },
    #[error("Blocking read failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Submit(#[from] ManagerError),
}

#[derive(Debug, Clone)]
pub enum RemoteSource {
    File { dir: PathBuf, key: String },
    Http { client: reqwest::Client, url: String, key: String },
}

impl RemoteSource {
    /// Build the source for `config`, with `key` already rendered for this host.
    pub fn from_config(config: &RemoteConfig, key: String) -> Result<Self, SourceError> {
        match config.kind {
            RemoteKind::File => Ok(RemoteSource::File {
                dir: PathBuf::from(&config.location),
                key,
            }),
            RemoteKind::Http => {
                let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
                let url = format!("{}/{}", config.location.trim_end_matches('/'), key);
                Ok(RemoteSource::Http { client, url, key })
            }
        }
    }

    pub fn key(&self) -> &str {
        match self {
            RemoteSource::File { key, .. } | RemoteSource::Http { key, .. } => key,
        }
    }

    /// Human-readable location of the value, for logs.
    pub fn describe(&self) -> String {
        match self {
            RemoteSource::File { dir, key } => dir.join(key).display().to_string(),
            RemoteSource::Http { url, .. } => url.clone(),
        }
    }

    /// Raw value of the key, `None` when it does not exist.
    pub async fn fetch_raw(&self) -> Result<Option<Vec<u8>>, SourceError> {
        match self {
            RemoteSource::File { dir, key } => {
                let path = dir.join(key);
                tokio::task::spawn_blocking(move || match std::fs::read(&path) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(SourceError::Read { path, source }),
                })
                .await?
            }
            RemoteSource::Http { client, url, .. } => {
                let response = client.get(url).send().await?;
                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(SourceError::Status {
                        url: url.clone(),
                        status: status.as_u16(),
                    });
                }
                Ok(Some(response.bytes().await?.to_vec()))
            }
        }
    }

    /// Parsed snapshot under the key, `None` when it does not exist.
    pub async fn fetch(&self) -> Result<Option<Vec<CollectEntry>>, SourceError> {
        let Some(raw) = self.fetch_raw().await? else {
            return Ok(None);
        };
        parse_snapshot_json(&raw)
            .map(Some)
            .map_err(|source| SourceError::Payload {
                key: self.key().to_string(),
                source,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Submitted,
    Unchanged,
    Absent,
}

/// Polls a [`RemoteSource`] and forwards changed snapshots.
pub struct RemoteWatcher {
    source: RemoteSource,
    interval: Duration,
    sender: SnapshotSender,
    last_submitted: Option<Vec<CollectEntry>>,
    submitted: u64,
}

impl RemoteWatcher {
    pub fn new(source: RemoteSource, interval: Duration, sender: SnapshotSender) -> Self {
        Self {
            source,
            interval,
            sender,
            last_submitted: None,
            submitted: 0,
        }
    }

    /// Snapshot the manager already has, so an unchanged value is not resubmitted.
    pub fn with_last_submitted(mut self, entries: Vec<CollectEntry>) -> Self {
        self.last_submitted = Some(entries);
        self
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub async fn poll_once(&mut self) -> Result<PollOutcome, SourceError> {
        let Some(entries) = self.source.fetch().await? else {
            return Ok(PollOutcome::Absent);
        };
        if self.last_submitted.as_ref() == Some(&entries) {
            return Ok(PollOutcome::Unchanged);
        }

        info!(key = %self.source.key(), entries = entries.len(), "Collect snapshot changed");
        self.sender.submit(entries.clone()).await?;
        self.last_submitted = Some(entries);
        self.submitted += 1;
        Ok(PollOutcome::Submitted)
    }

    /// Poll until `stop` flips to true or the task manager goes away.
    /// Returns the number of snapshots submitted.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> u64 {
        info!(
            source = %self.source.describe(),
            interval_secs = self.interval.as_secs_f64(),
            "Watching remote collect snapshot"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the caller already fetched once.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(PollOutcome::Absent) => {
                            debug!(key = %self.source.key(), "Collect key absent, keeping current tasks");
                        }
                        Ok(_) => {}
                        Err(SourceError::Submit(e)) => {
                            warn!(error = %e, "Task manager gone, stopping remote watch");
                            break;
                        }
                        Err(e) => {
                            warn!(key = %self.source.key(), error = %e, "Remote fetch failed, retrying next tick");
                        }
                    }
                }
            }
        }

        debug!(submitted = self.submitted, "Remote watch stopped");
        self.submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_source(dir: &std::path::Path) -> RemoteSource {
        RemoteSource::from_config(
            &RemoteConfig {
                kind: RemoteKind::File,
                location: dir.display().to_string(),
                key: "unused".to_string(),
                interval_secs: 1,
            },
            "collect_log_10.0.0.1_conf".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_source_absent_key() {
        let tmp = tempfile::tempdir().unwrap();
        let source = file_source(tmp.path());
        assert!(source.fetch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_source_reads_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("collect_log_10.0.0.1_conf"),
            r#"[{"path":"/var/log/a.log","topic":"a"}]"#,
        )
        .unwrap();
        let source = file_source(tmp.path());
        let entries = source.fetch().await.unwrap().unwrap();
        assert_eq!(entries, vec![CollectEntry::new("/var/log/a.log", "a")]);
    }

    #[tokio::test]
    async fn test_file_source_malformed_value() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("collect_log_10.0.0.1_conf"), "{not json").unwrap();
        let source = file_source(tmp.path());
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, SourceError::Payload { ref key, .. } if key == "collect_log_10.0.0.1_conf"));
    }

    #[test]
    fn test_http_url_joins_key() {
        let source = RemoteSource::from_config(
            &RemoteConfig {
                kind: RemoteKind::Http,
                location: "http://config.internal/kv/".to_string(),
                key: "unused".to_string(),
                interval_secs: 1,
            },
            "collect_log_10.0.0.1_conf".to_string(),
        )
        .unwrap();
        assert_eq!(source.describe(), "http://config.internal/kv/collect_log_10.0.0.1_conf");
        assert_eq!(source.key(), "collect_log_10.0.0.1_conf");
    }
}
