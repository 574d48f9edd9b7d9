//! Kafka source (spec.md §2 component table: broker source, 8% share).
//!
//! Reworked from the teacher's `source_kafka.rs`: that version ran with
//! `enable.auto.commit=true` and handed callers a bare `Stream<Value>`.
//! Hermod's Ack contract needs the offset commit to happen only after
//! downstream delivery, so auto-commit is off here and `ack` drives a
//! manual per-partition commit instead.

use std::time::Duration;

use async_trait::async_trait;
use hermod_core::config::KafkaSourceSpec;
use hermod_core::{HermodError, Message, Operation, Source};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct KafkaSource {
    spec: KafkaSourceSpec,
    consumer: Option<std::sync::Arc<StreamConsumer>>,
    rx: Option<mpsc::Receiver<Result<Message, HermodError>>>,
    task: Option<JoinHandle<()>>,
}

impl KafkaSource {
    pub fn new(spec: KafkaSourceSpec) -> Self {
        Self {
            spec,
            consumer: None,
            rx: None,
            task: None,
        }
    }

    fn build_consumer(&self) -> Result<StreamConsumer, HermodError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.spec.brokers)
            .set("group.id", &self.spec.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| HermodError::Configuration(e.to_string()))
    }

    async fn ensure_stream(&mut self) -> Result<(), HermodError> {
        if self.rx.is_some() {
            return Ok(());
        }
        let consumer = std::sync::Arc::new(self.build_consumer()?);
        consumer
            .subscribe(&[&self.spec.topic])
            .map_err(|e| HermodError::Configuration(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let task_consumer = consumer.clone();
        let handle = tokio::spawn(async move {
            loop {
                match task_consumer.recv().await {
                    Ok(borrowed) => {
                        let payload = borrowed.payload().unwrap_or_default().to_vec();
                        let mut msg = Message::default();
                        msg.set_id(format!(
                            "{}-{}-{}",
                            borrowed.topic(),
                            borrowed.partition(),
                            borrowed.offset()
                        ))
                            .set_operation(Operation::Create)
                            .set_table(borrowed.topic().to_string())
                            .set_metadata("source", "kafka")
                            .set_metadata("topic", borrowed.topic().to_string())
                            .set_metadata("partition", borrowed.partition().to_string())
                            .set_metadata("offset", borrowed.offset().to_string());
                        msg.set_payload(payload.clone());
                        if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(&payload) {
                            msg.set_data(map.into_iter().collect());
                        }
                        msg.set_after(payload);
                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "kafka consume error");
                        if tx
                            .send(Err(HermodError::TransientIo(e.into())))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        self.consumer = Some(consumer);
        self.rx = Some(rx);
        self.task = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, HermodError> {
        self.ensure_stream().await?;
        let rx = self.rx.as_mut().unwrap();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            item = rx.recv() => match item {
                Some(Ok(msg)) => Ok(Some(msg)),
                Some(Err(e)) => if e.is_configuration() { Err(e) } else { Ok(None) },
                None => Ok(None),
            }
        }
    }

    async fn ack(&mut self, msg: &Message) -> Result<(), HermodError> {
        let (Some(topic), Some(partition), Some(offset)) = (
            msg.metadata_get("topic"),
            msg.metadata_get("partition").and_then(|v| v.parse::<i32>().ok()),
            msg.metadata_get("offset").and_then(|v| v.parse::<i64>().ok()),
        ) else {
            return Ok(());
        };
        let Some(consumer) = &self.consumer else { return Ok(()) };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| HermodError::Other(e.into()))?;
        consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| HermodError::TransientIo(e.into()))
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        if self.consumer.is_none() {
            self.consumer = Some(std::sync::Arc::new(self.build_consumer()?));
        }
        let consumer = self.consumer.clone().unwrap();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, Duration::from_secs(5))
                .map(|_| ())
        })
        .await
        .map_err(|e| HermodError::TransientIo(e.into()))?
        .map_err(|e| HermodError::TransientIo(e.into()))
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx = None;
        self.consumer = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
