//! Bidirectional message relay between the two legs of a connection

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::mcp::types::{error_reply, JsonRpcError, MessageKind};
use crate::mcp::TransportError;
use crate::transport::Transport;

/// Last time a message crossed a connection
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay messages both ways until either leg closes, then close both
pub async fn bridge(
    label: &str,
    client: Arc<dyn Transport>,
    backing: Arc<dyn Transport>,
    activity: Arc<Activity>,
) {
    let upstream = client_to_backing(label, client.as_ref(), backing.as_ref(), &activity);
    let downstream = backing_to_client(label, backing.as_ref(), client.as_ref(), &activity);

    tokio::select! {
        _ = upstream => {
            tracing::debug!(connection = %label, "Client leg ended");
        }
        _ = downstream => {
            tracing::debug!(connection = %label, "Backing leg ended");
        }
    }

    client.close().await;
    backing.close().await;
}

async fn client_to_backing(
    label: &str,
    client: &dyn Transport,
    backing: &dyn Transport,
    activity: &Activity,
) {
    while let Some(message) = client.recv().await {
        activity.touch();
        let is_request = MessageKind::of(&message) == MessageKind::Request;

        match backing.send(message.clone()).await {
            Ok(()) => {}
            Err(TransportError::Closed) => return,
            Err(e) => {
                tracing::warn!(connection = %label, error = %e, "Failed to deliver message to backend");
                // The client is still waiting on this id
                if is_request {
                    let reply = error_reply(&message, JsonRpcError::internal_error(e.to_string()));
                    if client.send(reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn backing_to_client(
    label: &str,
    backing: &dyn Transport,
    client: &dyn Transport,
    activity: &Activity,
) {
    while let Some(message) = backing.recv().await {
        activity.touch();
        if let Err(e) = client.send(message).await {
            tracing::debug!(connection = %label, error = %e, "Client leg rejected message");
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_bridge_relays_both_ways_and_closes_together() {
        let (client_far, client_near) = ChannelTransport::pair();
        let (backing_near, backing_far) = ChannelTransport::pair();
        let activity = Arc::new(Activity::new());

        let relay = tokio::spawn(bridge(
            "test",
            client_near,
            backing_near,
            activity.clone(),
        ));

        client_far
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        let at_backend = backing_far.recv().await.unwrap();
        assert_eq!(at_backend["method"], "ping");

        backing_far
            .send(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
            .await
            .unwrap();
        let at_client = client_far.recv().await.unwrap();
        assert_eq!(at_client["id"], 1);
        assert!(activity.idle_for() < Duration::from_secs(5));

        backing_far.close().await;
        relay.await.unwrap();
        assert!(client_far.is_closed());
    }

    #[test]
    fn test_activity_tracks_last_touch() {
        let activity = Activity::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(activity.idle_for() >= Duration::from_millis(20));
        activity.touch();
        assert!(activity.idle_for() < Duration::from_millis(20));
    }
}
