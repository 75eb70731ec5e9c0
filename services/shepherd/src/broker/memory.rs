//! In-process broker hub.
//!
//! Topic-keyed fan-out over unbounded channels, preserving per-topic FIFO.
//! Used by the test suites and by `broker.mode = "memory"`, which lets the
//! whole service (websocket commands included) run without a Kafka
//! deployment; the wire format and dispatch path are identical.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{BrokerError, Delivery, MessageConsumer, MessageProducer};

type SubscriberMap = HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    subscribers: Arc<Mutex<SubscriberMap>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// A producer handle publishing into this hub.
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// A consumer subscribed to `topics`.  Only records published after the
    /// subscription are delivered.
    pub async fn consumer(&self, topics: &[String]) -> MemoryConsumer {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().await;
        for topic in topics {
            subscribers
                .entry(topic.clone())
                .or_default()
                .push(tx.clone());
        }
        MemoryConsumer { rx }
    }
}

#[derive(Clone)]
pub struct MemoryProducer {
    subscribers: Arc<Mutex<SubscriberMap>>,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(topic) {
            // Dropped consumers are pruned as their channels close.
            senders.retain(|tx| {
                tx.send(Delivery {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
        Ok(())
    }
}

pub struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<Delivery, BrokerError> {
        self.rx.recv().await.ok_or(BrokerError::Disconnected)
    }
}
