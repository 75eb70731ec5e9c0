//! Kafka-backed broker implementations.
//!
//! One `StreamConsumer` subscribed to the configured topic set and one
//! `FutureProducer`, both long-lived.  Offsets auto-commit; delivery
//! semantics beyond that are the broker's own.

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message};

use super::{BrokerError, Delivery, MessageConsumer, MessageProducer};

pub struct KafkaConsumer {
    inner: StreamConsumer,
}

impl KafkaConsumer {
    /// Create a consumer in `group` and subscribe it to `topics`.
    pub fn connect(host: &str, group: &str, topics: &[String]) -> Result<KafkaConsumer, BrokerError> {
        let inner: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", host)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        inner
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(KafkaConsumer { inner })
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn poll(&mut self) -> Result<Delivery, BrokerError> {
        let message = self
            .inner
            .recv()
            .await
            .map_err(|e| BrokerError::Poll(e.to_string()))?;
        Ok(Delivery {
            topic: message.topic().to_owned(),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }
}

pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    pub fn connect(host: &str) -> Result<KafkaProducer, BrokerError> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", host)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(KafkaProducer { inner })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn send_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let record = FutureRecord::<(), _>::to(topic).payload(&payload);
        self.inner
            .send(record, Timeout::Never)
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Send {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })
    }
}
