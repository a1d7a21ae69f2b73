//! Server log store
//!
//! Keeps the most recent [`ServerLogEvent`]s in a bounded ring buffer and fans
//! every new event out to live subscribers. Each record is mirrored through
//! `tracing` so the process log carries the same information.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use metamcp_shared::{LogLevel, ServerLogEvent};
use tokio::sync::broadcast;

/// Default number of events kept in memory
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

const SUBSCRIBER_BUFFER: usize = 256;

/// Bounded in-memory log sink shared by transports, pools and the aggregator
#[derive(Clone)]
pub struct ServerLogStore {
    entries: Arc<Mutex<VecDeque<ServerLogEvent>>>,
    capacity: usize,
    feed: broadcast::Sender<ServerLogEvent>,
}

impl ServerLogStore {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)))),
            capacity: capacity.max(1),
            feed,
        }
    }

    /// Append an event, evicting the oldest one when full
    pub fn record(&self, event: ServerLogEvent) {
        let error = event.error.as_deref().unwrap_or("");
        match event.level {
            LogLevel::Info => {
                tracing::info!(server = %event.server_name, error = %error, "{}", event.message)
            }
            LogLevel::Warn => {
                tracing::warn!(server = %event.server_name, error = %error, "{}", event.message)
            }
            LogLevel::Error => {
                tracing::error!(server = %event.server_name, error = %error, "{}", event.message)
            }
        }

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(event.clone());
        }

        // No subscribers is fine
        let _ = self.feed.send(event);
    }

    pub fn info(&self, server_name: &str, message: impl Into<String>) {
        self.record(ServerLogEvent::new(server_name, LogLevel::Info, message));
    }

    pub fn warn(&self, server_name: &str, message: impl Into<String>) {
        self.record(ServerLogEvent::new(server_name, LogLevel::Warn, message));
    }

    pub fn error(&self, server_name: &str, message: impl Into<String>, error: impl std::fmt::Display) {
        self.record(ServerLogEvent::new(server_name, LogLevel::Error, message).with_error(error));
    }

    /// Oldest-first copy of the buffered events, optionally limited to the newest `limit`
    pub fn recent(&self, limit: Option<usize>) -> Vec<ServerLogEvent> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerLogEvent> {
        self.feed.subscribe()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ServerLogStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let logs = ServerLogStore::new(2);
        logs.info("a", "first");
        logs.info("a", "second");
        logs.info("a", "third");

        let messages: Vec<String> = logs.recent(None).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["second", "third"]);
    }

    #[test]
    fn test_recent_limit_returns_newest() {
        let logs = ServerLogStore::default();
        for i in 0..5 {
            logs.warn("b", format!("event {}", i));
        }

        let recent = logs.recent(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].message, "event 4");
    }

    #[tokio::test]
    async fn test_subscribers_receive_live_events() {
        let logs = ServerLogStore::default();
        let mut feed = logs.subscribe();

        logs.error("github", "Backend unavailable", "connection refused");

        let event = feed.recv().await.unwrap();
        assert_eq!(event.server_name, "github");
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_clear() {
        let logs = ServerLogStore::default();
        logs.info("a", "x");
        logs.clear();
        assert!(logs.is_empty());
    }
}
