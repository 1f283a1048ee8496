use crate::BusSink;
use logagent_protocol::LogMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the forwarder did before the bus closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub written: u64,
    pub write_errors: u64,
    pub flushes: u64,
}

/// Drain the bus channel into `sink` on a blocking thread.
///
/// The sink is flushed whenever the channel runs dry and once more after
/// the last sender is dropped, which is also when the returned handle
/// resolves. Write failures are logged and counted; the message is lost.
pub fn spawn_forwarder(
    rx: mpsc::Receiver<LogMessage>,
    sink: Box<dyn BusSink>,
) -> JoinHandle<ForwardStats> {
    tokio::task::spawn_blocking(move || forward(rx, sink))
}

fn forward(mut rx: mpsc::Receiver<LogMessage>, mut sink: Box<dyn BusSink>) -> ForwardStats {
    let mut stats = ForwardStats::default();
    let mut dirty = false;

    loop {
        let msg = match rx.try_recv() {
            Ok(msg) => msg,
            Err(TryRecvError::Empty) => {
                if dirty {
                    flush(sink.as_mut(), &mut stats);
                    dirty = false;
                }
                match rx.blocking_recv() {
                    Some(msg) => msg,
                    None => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        match sink.write(&msg) {
            Ok(()) => {
                stats.written += 1;
                dirty = true;
            }
            Err(e) => {
                stats.write_errors += 1;
                warn!(topic = %msg.topic, path = %msg.path, error = %e, "Bus write failed, dropping line");
            }
        }
    }

    if dirty {
        flush(sink.as_mut(), &mut stats);
    }
    info!(
        written = stats.written,
        write_errors = stats.write_errors,
        "Bus forwarder stopped"
    );
    stats
}

fn flush(sink: &mut dyn BusSink, stats: &mut ForwardStats) {
    match sink.flush() {
        Ok(()) => {
            stats.flushes += 1;
            debug!(written = stats.written, "Bus flushed");
        }
        Err(e) => warn!(error = %e, "Bus flush failed"),
    }
}
