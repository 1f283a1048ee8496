//! Agent bootstrap and shutdown.

use crate::config::AgentConfig;
use crate::net::resolve_node_ip;
use crate::source::{RemoteSource, RemoteWatcher};
use anyhow::{Context, Result};
use logagent_protocol::CollectEntry;
use logagent_sinks::{open_sink, spawn_forwarder, ForwardStats, SinkSpec};
use logagent_tail::{ChannelPublisher, ShutdownReport, TailTaskFactory, TaskManager, METRICS};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// What happened between start and shutdown.
#[derive(Debug, Clone, Default)]
pub struct AgentReport {
    /// `None` when the task manager did not finish within the grace period.
    pub shutdown: Option<ShutdownReport>,
    /// `None` when the bus did not drain within the grace period.
    pub forwarded: Option<ForwardStats>,
    pub remote_submissions: u64,
}

/// Where the initial snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSource {
    Remote,
    Local,
}

/// Run the agent until `shutdown` resolves.
pub async fn run<S>(config: AgentConfig, shutdown: S) -> Result<AgentReport>
where
    S: Future<Output = ()>,
{
    config.validate().context("Invalid agent configuration")?;

    let ip = resolve_node_ip(config.node.ip);
    let key = config.collect_key(ip);
    info!(%ip, key = %key, "Starting log agent");

    // Bus
    let sink_spec = SinkSpec::parse(&config.bus.uri).context("Invalid bus URI")?;
    let sink = open_sink(&sink_spec)
        .with_context(|| format!("Failed to open bus sink {}", config.bus.uri))?;
    let (publisher, bus_rx) = ChannelPublisher::channel(config.bus.channel_capacity);
    let forwarder = spawn_forwarder(bus_rx, sink);
    info!(uri = %config.bus.uri, capacity = config.bus.channel_capacity, "Bus ready");

    let factory = TailTaskFactory::new(config.tail.to_tail_config(), Arc::new(publisher));

    let source = match &config.remote {
        Some(remote) => Some(
            RemoteSource::from_config(remote, key.clone())
                .context("Failed to set up remote snapshot source")?,
        ),
        None => None,
    };
    let (initial, origin) = initial_snapshot(&config, source.as_ref()).await;
    info!(entries = initial.len(), origin = ?origin, "Initial collect snapshot");

    let handle = TaskManager::start(
        factory,
        config.manager.to_manager_config(),
        initial.clone(),
    )
    .await
    .context("Failed to start task manager")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher = match (source, &config.remote) {
        (Some(source), Some(remote)) => {
            let mut watcher = RemoteWatcher::new(source, remote.interval(), handle.sender());
            if origin == InitialSource::Remote {
                watcher = watcher.with_last_submitted(initial);
            }
            Some(tokio::spawn(watcher.run(stop_rx)))
        }
        _ => None,
    };

    shutdown.await;
    info!("Shutdown requested");

    let _ = stop_tx.send(true);
    let remote_submissions = match watcher {
        Some(watcher) => watcher.await.unwrap_or_else(|e| {
            warn!(error = %e, "Remote watcher ended abnormally");
            0
        }),
        None => 0,
    };

    let grace = config.manager.shutdown_grace();
    let deadline = tokio::time::Instant::now() + grace;
    let shutdown_report = match tokio::time::timeout_at(deadline, handle.shutdown()).await {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            warn!(error = %e, "Task manager shutdown failed");
            None
        }
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "Tasks did not stop within the grace period");
            None
        }
    };

    // The last publisher goes away with the manager's factory and task threads.
    let forwarded = match tokio::time::timeout_at(deadline, forwarder).await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            warn!(error = %e, "Bus forwarder ended abnormally");
            None
        }
        Err(_) => {
            warn!("Bus did not drain within the grace period");
            None
        }
    };

    if let Some(path) = config.metrics.textfile.clone() {
        dump_metrics(path).await;
    }

    info!("Agent stopped: {}", METRICS.snapshot().summary());
    Ok(AgentReport {
        shutdown: shutdown_report,
        forwarded,
        remote_submissions,
    })
}

async fn dump_metrics(path: PathBuf) {
    let target = path.clone();
    match tokio::task::spawn_blocking(move || write_metrics_textfile(&target)).await {
        Ok(Ok(())) => info!(path = %path.display(), "Wrote metrics textfile"),
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to write metrics textfile"),
        Err(e) => warn!(error = %e, "Metrics writer ended abnormally"),
    }
}

/// Replace `path` with the current counters in Prometheus text format.
///
/// Written to a sibling file first and renamed, so a collector never reads
/// a partial file.
pub fn write_metrics_textfile(path: &Path) -> std::io::Result<()> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    let staged = PathBuf::from(staged);
    std::fs::write(&staged, METRICS.prometheus_format())?;
    std::fs::rename(&staged, path)
}

/// Remote value when the key exists and parses, otherwise the local list.
pub async fn initial_snapshot(
    config: &AgentConfig,
    source: Option<&RemoteSource>,
) -> (Vec<CollectEntry>, InitialSource) {
    if let Some(source) = source {
        match source.fetch().await {
            Ok(Some(entries)) => return (entries, InitialSource::Remote),
            Ok(None) => {
                info!(source = %source.describe(), "No remote collect snapshot, using local entries");
            }
            Err(e) => {
                warn!(source = %source.describe(), error = %e, "Remote fetch failed, using local entries");
            }
        }
    }
    (config.collect.clone(), InitialSource::Local)
}
