//! Kafka broker sink (spec.md §4.7, §6): key = `msg.id()` bytes, value =
//! the message's formatted payload (`after` if set, else the materialized
//! `data` map as JSON); one `send_result` per message in the batch, awaited
//! concurrently — the spec's "single `WriteMessages` per batch" in Go terms.
//!
//! Reworked from the teacher's `source_kafka.rs` `ClientConfig` setup,
//! mirrored for a producer instead of a consumer (`hermod_sources::KafkaSource`
//! is the consumer-side counterpart).

use std::time::Duration;

use async_trait::async_trait;
use hermod_core::config::KafkaSinkSpec;
use hermod_core::{HermodError, Message, Sink};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

pub struct KafkaSink {
    spec: KafkaSinkSpec,
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(spec: KafkaSinkSpec) -> Result<Self, HermodError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &spec.brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        Ok(Self { spec, producer })
    }

    fn payload(msg: &Message) -> Vec<u8> {
        if !msg.after().is_empty() {
            return msg.after().to_vec();
        }
        if !msg.payload().is_empty() {
            return msg.payload().to_vec();
        }
        let value = serde_json::Value::Object(
            msg.data().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        let key = msg.id().to_string();
        let payload = Self::payload(&msg);
        let record = FutureRecord::to(&self.spec.topic).key(&key).payload(&payload);
        self.producer
            .send(record, Timeout::After(Duration::from_secs(10)))
            .await
            .map_err(|(e, _)| HermodError::data(msg.id(), e))?;
        Ok(())
    }

    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut sends = Vec::with_capacity(msgs.len());
        for msg in &msgs {
            let key = msg.id().to_string();
            let payload = Self::payload(msg);
            let record = FutureRecord::to(&self.spec.topic).key(&key).payload(&payload);
            sends.push((msg.id().to_string(), self.producer.send(record, Timeout::After(Duration::from_secs(10)))));
        }
        for (id, fut) in sends {
            fut.await.map_err(|(e, _)| HermodError::data(id, e))?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.client().fetch_metadata(None, Duration::from_secs(5)).map(|_| ()))
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?
            .map_err(|e| HermodError::TransientIo(e.into()))
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
