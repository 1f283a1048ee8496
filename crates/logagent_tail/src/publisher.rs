use crate::error::PublishError;
use logagent_protocol::LogMessage;
use tokio::sync::mpsc;

/// Where tail tasks hand off lines. Called from task threads, so blocking is allowed.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, msg: LogMessage) -> Result<(), PublishError>;
}

/// Feeds the bounded bus channel drained by the sink forwarder.
///
/// A full channel blocks the calling task thread, which slows tailing down
/// to what the bus can absorb.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<LogMessage>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::Sender<LogMessage>) -> Self {
        Self { tx }
    }

    /// Create the bus channel and its publisher side.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, msg: LogMessage) -> Result<(), PublishError> {
        // Must not be called from inside the async runtime; task threads are plain OS threads.
        self.tx.blocking_send(msg).map_err(|_| PublishError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_receiver() {
        let (publisher, mut rx) = ChannelPublisher::channel(4);
        publisher
            .publish(LogMessage::new("web_log", "/tmp/a.log", "hello"))
            .unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.line, "hello");
        assert_eq!(msg.topic, "web_log");
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (publisher, rx) = ChannelPublisher::channel(4);
        drop(rx);
        let err = publisher
            .publish(LogMessage::new("t", "/tmp/a.log", "x"))
            .unwrap_err();
        assert!(matches!(err, PublishError::Closed));
    }
}
