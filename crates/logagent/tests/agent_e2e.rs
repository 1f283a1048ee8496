//! Full agent runs: files on disk, file bus, local and remote snapshots.

use logagent::{AgentConfig, RemoteConfig, RemoteKind};
use logagent_protocol::{CollectEntry, LogMessage};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(10);

fn bus_lines(bus_dir: &Path, topic: &str) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(bus_dir.join(format!("{topic}.jsonl"))) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|l| serde_json::from_str::<LogMessage>(l).ok())
        .map(|m| m.line)
        .collect()
}

async fn wait_for_bus(bus_dir: &Path, topic: &str, count: usize) -> Vec<String> {
    let deadline = Instant::now() + WAIT;
    loop {
        let lines = bus_lines(bus_dir, topic);
        if lines.len() >= count || Instant::now() >= deadline {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn base_config(bus_dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.node.ip = Some("10.0.0.9".parse().unwrap());
    config.bus.uri = format!("file://{}", bus_dir.display());
    config.bus.channel_capacity = 16;
    config.tail.poll_interval_ms = 10;
    config.tail.from_beginning = true;
    config.manager.shutdown_grace_secs = 5;
    config
}

fn log_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_snapshot_ships_lines() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let bus_dir = tmp.path().join("bus");
    let web = log_file(tmp.path(), "access.log", "GET /\n\nGET /health\n");
    let sys = log_file(tmp.path(), "syslog", "kernel: up\n");

    let metrics_file = tmp.path().join("logagent.prom");
    let mut config = base_config(&bus_dir);
    config.metrics.textfile = Some(metrics_file.clone());
    config.collect = vec![
        CollectEntry::new(web.display().to_string(), "web_log"),
        CollectEntry::new(sys.display().to_string(), "sys_log"),
        CollectEntry::new(tmp.path().join("missing.log").display().to_string(), "gone"),
    ];

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let agent = tokio::spawn(logagent::run(config, async move {
        let _ = stop_rx.await;
    }));

    assert_eq!(wait_for_bus(&bus_dir, "web_log", 2).await, vec!["GET /", "GET /health"]);
    assert_eq!(wait_for_bus(&bus_dir, "sys_log", 1).await, vec!["kernel: up"]);

    let _ = stop_tx.send(());
    let report = tokio::time::timeout(WAIT, agent).await???;

    let shutdown = report.shutdown.expect("manager stopped within grace");
    assert_eq!(shutdown.cancelled, 2);
    assert_eq!(shutdown.panicked, 0);
    let forwarded = report.forwarded.expect("bus drained within grace");
    assert_eq!(forwarded.written, 3);
    assert_eq!(report.remote_submissions, 0);
    assert!(bus_lines(&bus_dir, "gone").is_empty());

    let exposition = std::fs::read_to_string(&metrics_file)?;
    assert!(exposition.contains("# TYPE logagent_tasks_started_total counter"));
    assert!(exposition.contains("logagent_lines_published_total"));
    assert!(!metrics_file.with_extension("prom.tmp").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_snapshot_drives_tasks() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let bus_dir = tmp.path().join("bus");
    let store = tmp.path().join("store");
    std::fs::create_dir_all(&store)?;

    let a = log_file(tmp.path(), "a.log", "from a\n");
    let b = log_file(tmp.path(), "b.log", "from b\n");
    let key_file = store.join("collect_log_10.0.0.9_conf");
    std::fs::write(
        &key_file,
        serde_json::to_vec(&vec![CollectEntry::new(a.display().to_string(), "topic_a")])?,
    )?;

    let mut config = base_config(&bus_dir);
    config.remote = Some(RemoteConfig {
        kind: RemoteKind::File,
        location: store.display().to_string(),
        key: "collect_log_{ip}_conf".to_string(),
        interval_secs: 1,
    });
    // Ignored while the remote key exists.
    config.collect = vec![CollectEntry::new(b.display().to_string(), "local_b")];

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let agent = tokio::spawn(logagent::run(config, async move {
        let _ = stop_rx.await;
    }));

    assert_eq!(wait_for_bus(&bus_dir, "topic_a", 1).await, vec!["from a"]);

    // Replace atomically so the watcher never sees a half-written value.
    let staged = store.join(".staged");
    std::fs::write(
        &staged,
        serde_json::to_vec(&vec![CollectEntry::new(b.display().to_string(), "topic_b")])?,
    )?;
    std::fs::rename(&staged, &key_file)?;
    assert_eq!(wait_for_bus(&bus_dir, "topic_b", 1).await, vec!["from b"]);

    let _ = stop_tx.send(());
    let report = tokio::time::timeout(WAIT, agent).await???;

    assert_eq!(report.remote_submissions, 1);
    let shutdown = report.shutdown.expect("manager stopped within grace");
    assert_eq!(shutdown.cancelled, 1);
    assert_eq!(shutdown.joined, 2);
    assert!(bus_lines(&bus_dir, "local_b").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_fails_fast() {
    let mut config = AgentConfig::default();
    config.bus.uri = "nowhere".to_string();
    let result = logagent::run(config, std::future::pending()).await;
    assert!(result.is_err());
}
