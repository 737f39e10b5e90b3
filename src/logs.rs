//! Log broadcaster: structured monitoring events fanned out to live subscribers.
//!
//! Entries go through a bounded intake queue to a single fan-out task, which
//! forwards each one to every subscriber. A slow subscriber loses entries
//! instead of stalling the pipeline.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::mail::reference_now;

const INTAKE_CAPACITY: usize = 100;
const SUBSCRIBER_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

/// One monitoring event.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_id: Option<i64>,
}

type Subscribers = Arc<RwLock<Vec<mpsc::Sender<LogEntry>>>>;

pub struct LogBroadcaster {
    intake: mpsc::Sender<LogEntry>,
    subscribers: Subscribers,
}

impl LogBroadcaster {
    /// Create the broadcaster and spawn its fan-out task. Must be called inside a runtime.
    pub fn new() -> Arc<Self> {
        let (intake, rx) = mpsc::channel(INTAKE_CAPACITY);
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        tokio::spawn(fan_out(rx, Arc::clone(&subscribers)));
        Arc::new(Self {
            intake,
            subscribers,
        })
    }

    /// Register a live subscriber.
    pub async fn subscribe(&self) -> ReceiverStream<LogEntry> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.write().await.push(tx);
        ReceiverStream::new(rx)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Record an event. Dropped when the intake queue is full.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, mailbox_id: Option<i64>) {
        let entry = LogEntry {
            timestamp: reference_now(),
            level,
            message: message.into(),
            mailbox_id,
        };
        mirror(&entry);
        if self.intake.try_send(entry).is_err() {
            debug!("Log intake full, entry dropped");
        }
    }

    pub fn info(&self, message: impl Into<String>, mailbox_id: Option<i64>) {
        self.log(LogLevel::Info, message, mailbox_id);
    }

    pub fn success(&self, message: impl Into<String>, mailbox_id: Option<i64>) {
        self.log(LogLevel::Success, message, mailbox_id);
    }

    pub fn warning(&self, message: impl Into<String>, mailbox_id: Option<i64>) {
        self.log(LogLevel::Warning, message, mailbox_id);
    }

    pub fn error(&self, message: impl Into<String>, mailbox_id: Option<i64>) {
        self.log(LogLevel::Error, message, mailbox_id);
    }

    pub fn debug(&self, message: impl Into<String>, mailbox_id: Option<i64>) {
        self.log(LogLevel::Debug, message, mailbox_id);
    }
}

fn mirror(entry: &LogEntry) {
    let mailbox_id = entry.mailbox_id.unwrap_or_default();
    match entry.level {
        LogLevel::Info | LogLevel::Success => info!(mailbox_id, "{}", entry.message),
        LogLevel::Warning => warn!(mailbox_id, "{}", entry.message),
        LogLevel::Error => error!(mailbox_id, "{}", entry.message),
        LogLevel::Debug => debug!(mailbox_id, "{}", entry.message),
    }
}

async fn fan_out(mut rx: mpsc::Receiver<LogEntry>, subscribers: Subscribers) {
    while let Some(entry) = rx.recv().await {
        let mut subs = subscribers.write().await;
        subs.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_entries() {
        let logs = LogBroadcaster::new();
        let mut a = logs.subscribe().await;
        let mut b = logs.subscribe().await;

        logs.success("Alert sent", Some(3));

        for stream in [&mut a, &mut b] {
            let entry = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.level, LogLevel::Success);
            assert_eq!(entry.message, "Alert sent");
            assert_eq!(entry.mailbox_id, Some(3));
        }
    }

    #[tokio::test]
    async fn closed_subscribers_are_removed() {
        let logs = LogBroadcaster::new();
        let dropped = logs.subscribe().await;
        let mut kept = logs.subscribe().await;
        drop(dropped);

        logs.info("tick", None);
        tokio::time::timeout(Duration::from_secs(1), kept.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logs.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_entries_without_blocking() {
        let logs = LogBroadcaster::new();
        let mut slow = logs.subscribe().await;

        for i in 0..30 {
            logs.debug(format!("entry {i}"), None);
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut received = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(50), slow.next()).await
        {
            received += 1;
        }
        assert!(received >= 1);
        assert!(received <= SUBSCRIBER_CAPACITY);
        assert_eq!(logs.subscriber_count().await, 1);
    }

    #[test]
    fn entry_serializes_lowercase_level() {
        let entry = LogEntry {
            timestamp: reference_now(),
            level: LogLevel::Warning,
            message: "m".into(),
            mailbox_id: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["level"], "warning");
        assert!(json.get("mailbox_id").is_none());
    }
}
