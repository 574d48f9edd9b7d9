//! Pinecone vector sink (spec.md §4.7, §6).
//!
//! Collects `{id, values, metadata}` vectors from `msg.data()` per
//! `vector_field` and POSTs a single upsert request per batch to
//! `/vectors/upsert`, authenticated with the `Api-Key` header — exactly the
//! wire contract spec.md §6 states.

use async_trait::async_trait;
use hermod_core::config::PineconeSinkSpec;
use hermod_core::{HermodError, Message, Sink};
use reqwest::Client;
use serde::Serialize;

#[derive(Serialize)]
struct PineconeVector {
    id: String,
    values: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct UpsertRequest {
    vectors: Vec<PineconeVector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
}

pub struct PineconeSink {
    spec: PineconeSinkSpec,
    client: Client,
}

impl PineconeSink {
    pub fn new(spec: PineconeSinkSpec) -> Self {
        Self {
            spec,
            client: Client::new(),
        }
    }

    fn to_vector(&self, msg: &Message) -> Result<PineconeVector, HermodError> {
        let raw = msg
            .data()
            .get(&self.spec.vector_field)
            .ok_or_else(|| HermodError::data(msg.id(), anyhow::anyhow!("missing vector field {:?}", self.spec.vector_field)))?;
        let values: Vec<f32> = raw
            .as_array()
            .ok_or_else(|| HermodError::data(msg.id(), anyhow::anyhow!("vector field is not an array")))?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| HermodError::data(msg.id(), anyhow::anyhow!("vector field contains non-numeric entries")))?;

        let mut metadata: serde_json::Map<String, serde_json::Value> = msg
            .data()
            .iter()
            .filter(|(k, _)| *k != &self.spec.vector_field)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let metadata = if metadata.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(std::mem::take(&mut metadata)))
        };

        Ok(PineconeVector {
            id: msg.id().to_string(),
            values,
            metadata,
        })
    }
}

#[async_trait]
impl Sink for PineconeSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        self.write_batch(vec![msg]).await
    }

    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut vectors = Vec::with_capacity(msgs.len());
        for msg in &msgs {
            vectors.push(self.to_vector(msg)?);
        }
        let body = UpsertRequest {
            vectors,
            namespace: self.spec.namespace.clone(),
        };
        let resp = self
            .client
            .post(format!("{}/vectors/upsert", self.spec.base_url.trim_end_matches('/')))
            .header("Api-Key", &self.spec.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        if !resp.status().is_success() {
            return Err(HermodError::TransientIo(anyhow::anyhow!(
                "pinecone upsert received status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        let resp = self
            .client
            .get(format!("{}/describe_index_stats", self.spec.base_url.trim_end_matches('/')))
            .header("Api-Key", &self.spec.api_key)
            .send()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(HermodError::TransientIo(anyhow::anyhow!(
                "pinecone ping received status {}",
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
    fn to_vector_splits_values_and_metadata() {
        let sink = PineconeSink::new(PineconeSinkSpec {
            id: "pc".into(),
            base_url: "https://example.pinecone.io".into(),
            api_key: "key".into(),
            namespace: None,
            vector_field: "embedding".into(),
        });
        let mut msg = Message::default();
        msg.set_id("v1").set_operation(Operation::Create);
        msg.data_mut().insert("embedding".into(), serde_json::json!([0.1, 0.2, 0.3]));
        msg.data_mut().insert("category".into(), serde_json::json!("news"));
        let vector = sink.to_vector(&msg).unwrap();
        assert_eq!(vector.id, "v1");
        assert_eq!(vector.values, vec![0.1, 0.2, 0.3]);
        assert!(vector.metadata.is_some());
    }
}
