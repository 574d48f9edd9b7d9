//! Milvus vector sink (spec.md §4.7): columnar insert. The ID column is
//! typed `Int64` when every id in the batch parses as one, else `VarChar`;
//! the configured vector field is coerced to `[]f32` per row. No ergonomic
//! native async Milvus crate exists in the corpus or the broader ecosystem
//! at the pinned dependency versions (DESIGN.md), so this goes over
//! Milvus's REST `/v2/vectordb/entities/insert` surface via `reqwest`,
//! matching the teacher's posture toward anything without a native driver
//! (see `sql_sink`'s Snowflake backend for the same pattern).

use async_trait::async_trait;
use hermod_core::config::MilvusSinkSpec;
use hermod_core::evaluator::get_msg_val_by_path;
use hermod_core::{HermodError, Message, Sink};
use reqwest::Client;
use serde_json::{json, Value};

pub struct MilvusSink {
    spec: MilvusSinkSpec,
    client: Client,
}

impl MilvusSink {
    pub fn new(spec: MilvusSinkSpec) -> Self {
        Self {
            spec,
            client: Client::new(),
        }
    }

    fn id_value(&self, msg: &Message, all_numeric: bool) -> Value {
        if all_numeric {
            msg.id().parse::<i64>().map(Value::from).unwrap_or_else(|_| json!(msg.id()))
        } else {
            json!(msg.id())
        }
    }

    fn vector_value(&self, msg: &Message) -> Result<Value, HermodError> {
        let raw = get_msg_val_by_path(msg, &self.spec.vector_field)
            .ok_or_else(|| HermodError::data(msg.id(), anyhow::anyhow!("missing vector field {:?}", self.spec.vector_field)))?;
        let floats: Vec<f32> = raw
            .as_array()
            .ok_or_else(|| HermodError::data(msg.id(), anyhow::anyhow!("vector field is not an array")))?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| HermodError::data(msg.id(), anyhow::anyhow!("vector field contains non-numeric entries")))?;
        Ok(json!(floats))
    }

    fn row(&self, msg: &Message, all_numeric: bool) -> Result<Value, HermodError> {
        let mut row = serde_json::Map::new();
        row.insert(self.spec.id_field.clone(), self.id_value(msg, all_numeric));
        row.insert(self.spec.vector_field.clone(), self.vector_value(msg)?);
        for mapping in &self.spec.mappings {
            if mapping.target_column == self.spec.id_field || mapping.target_column == self.spec.vector_field {
                continue;
            }
            let value = get_msg_val_by_path(msg, &mapping.source_field).unwrap_or(Value::Null);
            row.insert(mapping.target_column.clone(), value);
        }
        Ok(Value::Object(row))
    }
}

#[async_trait]
impl Sink for MilvusSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        self.write_batch(vec![msg]).await
    }

    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        let all_numeric = msgs.iter().all(|m| m.id().parse::<i64>().is_ok());
        let mut rows = Vec::with_capacity(msgs.len());
        for msg in &msgs {
            rows.push(self.row(msg, all_numeric)?);
        }
        let body = json!({
            "collectionName": self.spec.collection,
            "data": rows,
        });
        let resp = self
            .client
            .post(format!(
                "{}/v2/vectordb/entities/insert",
                self.spec.base_url.trim_end_matches('/')
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        if !resp.status().is_success() {
            return Err(HermodError::TransientIo(anyhow::anyhow!(
                "milvus insert received status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        let resp = self
            .client
            .get(format!("{}/v2/vectordb/collections/describe", self.spec.base_url.trim_end_matches('/')))
            .query(&[("collectionName", &self.spec.collection)])
            .send()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(HermodError::TransientIo(anyhow::anyhow!(
                "milvus ping received status {}",
                resp.status()
            )))
        }
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

    #[test]
    fn id_value_types_numeric_ids_as_int64() {
        let sink = MilvusSink::new(MilvusSinkSpec {
            id: "m".into(),
            base_url: "http://localhost:19530".into(),
            collection: "docs".into(),
            id_field: "id".into(),
            vector_field: "embedding".into(),
            mappings: vec![],
        });
        let mut msg = Message::default();
        msg.set_id("42").set_operation(Operation::Create);
        assert_eq!(sink.id_value(&msg, true), json!(42));
        assert_eq!(sink.id_value(&msg, false), json!("42"));
    }
}
