//! In-process event bus fanning decoded broker messages out to websocket
//! sessions.
//!
//! One broadcast channel per topic, created lazily on first use.  Payloads
//! are already-serialized JSON strings.  Subscribers only see messages
//! published after they subscribe; a subscriber that falls behind the channel
//! bound skips the missed messages and keeps going (drop-oldest).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Buffered payloads per subscriber before overrun.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Subscribe to `topic`, creating its channel on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).await.subscribe()
    }

    /// Publish `payload` under `topic`.  Publishing with zero subscribers is
    /// not an error.
    pub async fn publish(&self, topic: &str, payload: String) {
        let _ = self.sender(topic).await.send(payload);
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        {
            let topics = self.topics.read().await;
            if let Some(tx) = topics.get(topic) {
                return tx.clone();
            }
        }
        let mut topics = self.topics.write().await;
        if let Some(tx) = topics.get(topic) {
            return tx.clone();
        }
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        topics.insert(topic.to_owned(), tx.clone());
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_messages_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("environment-state").await;
        bus.publish("environment-state", "one".to_owned()).await;
        bus.publish("environment-state", "two".to_owned()).await;
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut state_rx = bus.subscribe("environment-state").await;
        let mut cell_rx = bus.subscribe("cell-receive").await;
        bus.publish("environment-state", "state".to_owned()).await;
        assert_eq!(state_rx.recv().await.unwrap(), "state");
        assert!(cell_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_messages() {
        let bus = EventBus::new();
        bus.publish("environment-state", "early".to_owned()).await;
        let mut rx = bus.subscribe("environment-state").await;
        bus.publish("environment-state", "late".to_owned()).await;
        assert_eq!(rx.recv().await.unwrap(), "late");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish("agent-receive", "dropped".to_owned()).await;
    }
}
