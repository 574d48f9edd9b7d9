//! Stdout sink: prints each message's materialized `data` as one JSON object
//! per line (spec.md §8 scenario 1: "CSV → JSON stdout").
//!
//! Reworked from the teacher's `sink_stdout.rs`, which printed Arrow
//! `RecordBatch` columns; Hermod has no columnar batch type, so this prints
//! the same `data` map every other sink reads from.

use async_trait::async_trait;
use hermod_core::config::StdoutSinkSpec;
use hermod_core::{HermodError, Message, Sink};

pub struct StdoutSink {
    spec: StdoutSinkSpec,
}

impl StdoutSink {
    pub fn new(spec: StdoutSinkSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn write(&mut self, mut msg: Message) -> Result<(), HermodError> {
        msg.ensure_data_from_after();
        let value = serde_json::Value::Object(
            msg.data().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        let rendered = if self.spec.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| HermodError::data(msg.id(), e))?;
        println!("{rendered}");
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_core::Operation;

    #[tokio::test]
    async fn writes_data_as_json_line() {
        let mut sink = StdoutSink::new(StdoutSinkSpec {
            id: "out".into(),
            pretty: false,
        });
        let mut msg = Message::default();
        msg.set_id("1").set_operation(Operation::Create);
        msg.data_mut().insert("id".into(), serde_json::json!("1"));
        msg.data_mut().insert("name".into(), serde_json::json!("John"));
        sink.write(msg).await.unwrap();
    }
}
