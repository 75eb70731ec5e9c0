//! Broker seam: topic-keyed publish and subscribe-with-poll.
//!
//! The gateway is written against the [`MessageConsumer`] / [`MessageProducer`]
//! traits so the broker stays an external collaborator.  Two implementations
//! ship with the service: the Kafka client (kafka.rs) for deployments and an
//! in-process hub (memory.rs) for tests and broker-less local development.

use async_trait::async_trait;
use shepherd_protocol::{envelope, Envelope};
use thiserror::Error;

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaConsumer, KafkaProducer};
pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection: {0}")]
    Connect(String),
    #[error("poll: {0}")]
    Poll(String),
    #[error("send to topic '{topic}': {reason}")]
    Send { topic: String, reason: String },
    #[error("encode for topic '{topic}': {source}")]
    Encode {
        topic: String,
        #[source]
        source: shepherd_protocol::EnvelopeError,
    },
    /// The consumer's stream is gone for good; the service should shut down.
    #[error("consumer disconnected")]
    Disconnected,
}

/// One record delivered from the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A consumer subscribed to a fixed topic set, polled by the gateway loop.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Block until the next record arrives.
    ///
    /// Transient failures return an error the poll loop logs and retries;
    /// [`BrokerError::Disconnected`] is terminal.
    async fn poll(&mut self) -> Result<Delivery, BrokerError>;
}

/// A producer of envelope-encoded messages.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Enqueue an already-encoded payload on `topic`.
    async fn send_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Encode `envelope` and enqueue it on `topic`.  Errors surface to the
    /// caller; there are no application-level retries.
    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let payload = envelope::encode(envelope).map_err(|source| BrokerError::Encode {
            topic: topic.to_owned(),
            source,
        })?;
        self.send_bytes(topic, payload).await
    }
}
