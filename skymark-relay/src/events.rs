//! Log events destined for the consumer
//!
//! Components report conditions through an [`EventLog`] handle. Each event
//! is mirrored to `tracing` and queued for the fusion loop, which forwards
//! it as a best-effort LOG message. The queue is bounded; when it is full
//! (consumer down for a long time) new events are dropped.

use skymark_common::messages::LogMessage;
use skymark_common::{time, Severity};
use tokio::sync::mpsc;

/// Default queue depth between components and the fusion loop
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Cloneable handle for reporting log events
#[derive(Debug, Clone)]
pub struct EventLog {
    tx: mpsc::Sender<LogMessage>,
}

/// Create an event log and the receiver the fusion loop drains
pub fn channel(capacity: usize) -> (EventLog, mpsc::Receiver<LogMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventLog { tx }, rx)
}

impl EventLog {
    pub fn info(&self, text: impl Into<String>) {
        self.emit(Severity::Info, text.into());
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.emit(Severity::Warning, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(Severity::Error, text.into());
    }

    /// Report an event at the given severity
    pub fn emit(&self, severity: Severity, text: String) {
        match severity {
            Severity::Error => tracing::error!("{}", text),
            Severity::Warning => tracing::warn!("{}", text),
            Severity::Info => tracing::info!("{}", text),
        }

        let event = LogMessage {
            severity,
            text,
            timestamp: time::now_millis(),
        };
        if self.tx.try_send(event).is_err() {
            tracing::trace!("Log event dropped (queue full or closed)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_queued_in_order() {
        let (log, mut rx) = channel(8);
        log.info("one");
        log.warn("two");
        log.error("three");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.severity, Severity::Info);
        assert_eq!(first.text, "one");
        assert_eq!(rx.recv().await.unwrap().severity, Severity::Warning);
        assert_eq!(rx.recv().await.unwrap().severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (log, mut rx) = channel(1);
        log.info("kept");
        log.info("dropped");
        assert_eq!(rx.recv().await.unwrap().text, "kept");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_does_not_panic() {
        let (log, rx) = channel(4);
        drop(rx);
        log.error("nobody listening");
    }
}
