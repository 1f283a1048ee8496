//! Remote sources driving a live task manager.

use anyhow::Result;
use logagent::{PollOutcome, RemoteConfig, RemoteKind, RemoteSource, RemoteWatcher, SourceError};
use logagent_protocol::CollectEntry;
use logagent_tail::{
    CancellationToken, CollectionTask, ManagerConfig, TaskError, TaskFactory, TaskManager,
    TaskManagerHandle,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const KEY: &str = "collect_log_10.0.0.5_conf";

/// Sits idle until cancelled; never touches the filesystem.
struct IdleTask {
    entry: CollectEntry,
    token: CancellationToken,
}

impl CollectionTask for IdleTask {
    fn path(&self) -> &str {
        &self.entry.path
    }

    fn topic(&self) -> &str {
        &self.entry.topic
    }

    fn initialize(&self) -> Result<(), TaskError> {
        Ok(())
    }

    fn run(&self) {
        while !self.token.is_cancelled() {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

struct IdleFactory;

impl TaskFactory for IdleFactory {
    type Task = IdleTask;

    fn create(&self, entry: &CollectEntry) -> IdleTask {
        IdleTask {
            entry: entry.clone(),
            token: CancellationToken::new(),
        }
    }
}

fn remote(kind: RemoteKind, location: String) -> RemoteConfig {
    RemoteConfig {
        kind,
        location,
        key: "collect_log_{ip}_conf".to_string(),
        interval_secs: 1,
    }
}

fn file_source(dir: &Path) -> RemoteSource {
    RemoteSource::from_config(&remote(RemoteKind::File, dir.display().to_string()), KEY.to_string())
        .expect("file source")
}

/// Stage and rename so a reader never sees a partial value.
fn put(dir: &Path, payload: &str) -> PathBuf {
    let staged = dir.join(".staged");
    let target = dir.join(KEY);
    std::fs::write(&staged, payload).expect("write staged value");
    std::fs::rename(&staged, &target).expect("publish value");
    target
}

fn put_entries(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
    let entries: Vec<CollectEntry> = entries.iter().map(|(p, t)| CollectEntry::new(*p, *t)).collect();
    put(dir, &serde_json::to_string(&entries).expect("encode entries"))
}

async fn manager() -> Result<TaskManagerHandle> {
    Ok(TaskManager::start(IdleFactory, ManagerConfig::default(), Vec::new()).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_follows_key_through_its_lifecycle() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let handle = manager().await?;
    let mut watcher = RemoteWatcher::new(file_source(tmp.path()), Duration::from_secs(1), handle.sender());

    // Never written: nothing to do.
    assert_eq!(watcher.poll_once().await?, PollOutcome::Absent);
    assert_eq!(watcher.submitted(), 0);

    let key_file = put_entries(tmp.path(), &[("/logs/a.log", "a")]);
    assert_eq!(watcher.poll_once().await?, PollOutcome::Submitted);
    let view = timeout(WAIT, handle.wait_for_applied(1)).await??;
    assert_eq!(view.paths(), vec!["/logs/a.log"]);

    // Same value again is not resubmitted.
    assert_eq!(watcher.poll_once().await?, PollOutcome::Unchanged);
    assert_eq!(watcher.submitted(), 1);

    // Deleted key leaves the running tasks alone.
    std::fs::remove_file(&key_file)?;
    assert_eq!(watcher.poll_once().await?, PollOutcome::Absent);
    assert_eq!(watcher.submitted(), 1);
    assert_eq!(handle.view().paths(), vec!["/logs/a.log"]);
    assert_eq!(handle.view().applied_snapshots, 1);

    put_entries(tmp.path(), &[("/logs/b.log", "b")]);
    assert_eq!(watcher.poll_once().await?, PollOutcome::Submitted);
    let view = timeout(WAIT, handle.wait_for_applied(2)).await??;
    assert_eq!(view.paths(), vec!["/logs/b.log"]);

    // A malformed value is reported and changes nothing.
    put(tmp.path(), "[{\"path\": \"/logs/c.log\"");
    let err = watcher.poll_once().await.unwrap_err();
    assert!(matches!(err, SourceError::Payload { ref key, .. } if key == KEY));
    assert_eq!(watcher.submitted(), 2);
    assert_eq!(handle.view().paths(), vec!["/logs/b.log"]);

    // The next good value goes through.
    put_entries(tmp.path(), &[("/logs/b.log", "b"), ("/logs/c.log", "c")]);
    assert_eq!(watcher.poll_once().await?, PollOutcome::Submitted);
    let view = timeout(WAIT, handle.wait_for_applied(3)).await??;
    assert_eq!(view.paths(), vec!["/logs/b.log", "/logs/c.log"]);
    assert_eq!(watcher.submitted(), 3);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_skips_value_the_manager_already_has() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    put_entries(tmp.path(), &[("/logs/a.log", "a")]);
    let initial = vec![CollectEntry::new("/logs/a.log", "a")];
    let handle = TaskManager::start(IdleFactory, ManagerConfig::default(), initial.clone()).await?;

    let mut watcher = RemoteWatcher::new(file_source(tmp.path()), Duration::from_secs(1), handle.sender())
        .with_last_submitted(initial);
    assert_eq!(watcher.poll_once().await?, PollOutcome::Unchanged);
    assert_eq!(handle.view().applied_snapshots, 0);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_loop_submits_changes_until_stopped() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let handle = manager().await?;
    let watcher = RemoteWatcher::new(file_source(tmp.path()), Duration::from_millis(20), handle.sender());
    let (stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(watcher.run(stop_rx));

    put_entries(tmp.path(), &[("/logs/a.log", "a")]);
    let view = timeout(WAIT, handle.wait_for_applied(1)).await??;
    assert_eq!(view.paths(), vec!["/logs/a.log"]);

    put_entries(tmp.path(), &[("/logs/b.log", "b")]);
    let view = timeout(WAIT, handle.wait_for_applied(2)).await??;
    assert_eq!(view.paths(), vec!["/logs/b.log"]);

    stop_tx.send(true)?;
    assert_eq!(timeout(WAIT, running).await??, 2);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_loop_ends_when_manager_stops() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let handle = manager().await?;
    let watcher = RemoteWatcher::new(file_source(tmp.path()), Duration::from_millis(20), handle.sender());
    let (_stop_tx, stop_rx) = watch::channel(false);
    let running = tokio::spawn(watcher.run(stop_rx));

    handle.shutdown().await?;
    put_entries(tmp.path(), &[("/logs/a.log", "a")]);

    assert_eq!(timeout(WAIT, running).await??, 0);
    Ok(())
}

/// Answers every request with the same status and body.
async fn serve(status: &'static str, body: &'static str) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    Ok(format!("http://{addr}/kv"))
}

fn http_source(location: String) -> RemoteSource {
    RemoteSource::from_config(&remote(RemoteKind::Http, location), KEY.to_string())
        .expect("http source")
}

#[tokio::test]
async fn test_http_not_found_means_absent() -> Result<()> {
    let source = http_source(serve("404 Not Found", "").await?);
    assert!(source.fetch().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_http_value_is_parsed() -> Result<()> {
    let source = http_source(serve("200 OK", r#"[{"path":"/logs/a.log","topic":"a"}]"#).await?);
    let entries = source.fetch().await?;
    assert_eq!(entries, Some(vec![CollectEntry::new("/logs/a.log", "a")]));
    Ok(())
}

#[tokio::test]
async fn test_http_server_error_is_reported() -> Result<()> {
    let source = http_source(serve("503 Service Unavailable", "").await?);
    let err = source.fetch().await.unwrap_err();
    assert!(matches!(err, SourceError::Status { status: 503, .. }));
    Ok(())
}
