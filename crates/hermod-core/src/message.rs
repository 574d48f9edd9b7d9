//! The canonical [`Message`] envelope and its process-wide pool.
//!
//! A `Message` is the unit of transit between a [`crate::Source`] and one or
//! more [`crate::Sink`]s. It is obtained from a [`MessagePool`] via
//! [`MessagePool::acquire`] and returned via [`MessagePool::release`]; the
//! pool is a correctness contract, not just an allocation optimization — see
//! spec invariant 5: every acquired message must be released back exactly
//! once, after Ack or permanent failure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The operation a [`Message`] represents, per spec.md §3 invariant 2.
///
/// An empty/unrecognized wire value is treated as [`Operation::Create`] —
/// callers that parse operations off the wire should go through
/// [`Operation::parse`] rather than constructing this directly from
/// untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Snapshot,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Create
    }
}

impl Operation {
    /// Parse a wire-level operation tag, defaulting to `Create` for an empty
    /// or unrecognized value (spec.md §3 invariant 2).
    pub fn parse(raw: &str) -> Operation {
        match raw.to_ascii_lowercase().as_str() {
            "update" => Operation::Update,
            "delete" => Operation::Delete,
            "snapshot" => Operation::Snapshot,
            _ => Operation::Create,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Snapshot => "snapshot",
        }
    }
}

/// The canonical event record flowing through a Hermod pipeline.
///
/// Ownership is single: the engine owns a `Message` from
/// [`crate::Source::read`] through [`crate::Source::ack`]; no sink may
/// retain one past its `write`/`write_batch` call returning (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct Message {
    id: String,
    operation: Operation,
    schema: String,
    table: String,
    before: Vec<u8>,
    after: Vec<u8>,
    payload: Vec<u8>,
    data: HashMap<String, serde_json::Value>,
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = id.into();
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn set_operation(&mut self, op: Operation) -> &mut Self {
        self.operation = op;
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn set_schema(&mut self, schema: impl Into<String>) -> &mut Self {
        self.schema = schema.into();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn set_table(&mut self, table: impl Into<String>) -> &mut Self {
        self.table = table.into();
        self
    }

    pub fn before(&self) -> &[u8] {
        &self.before
    }

    pub fn set_before(&mut self, before: Vec<u8>) -> &mut Self {
        self.before = before;
        self
    }

    pub fn after(&self) -> &[u8] {
        &self.after
    }

    pub fn set_after(&mut self, after: Vec<u8>) -> &mut Self {
        self.after = after;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) -> &mut Self {
        self.payload = payload;
        self
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.data
    }

    pub fn set_data(&mut self, data: HashMap<String, serde_json::Value>) -> &mut Self {
        self.data = data;
        self
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Materialize `data` lazily from `after` when the source only populated
    /// the raw byte payload (spec.md §3: "may be materialized lazily from
    /// `after`").
    pub fn ensure_data_from_after(&mut self) {
        if !self.data.is_empty() || self.after.is_empty() {
            return;
        }
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(&self.after) {
            self.data = map.into_iter().collect();
        }
    }

    /// The LSN carried in `metadata.lsn`, if present and well-formed.
    pub fn lsn(&self) -> Option<i64> {
        self.metadata.get("lsn").and_then(|v| v.parse().ok())
    }

    /// Reset all fields to their defaults, in place. Called by
    /// [`crate::pool::MessagePool::release`]; never by application code
    /// directly.
    pub(crate) fn reset(&mut self) {
        self.id.clear();
        self.operation = Operation::default();
        self.schema.clear();
        self.table.clear();
        self.before.clear();
        self.after.clear();
        self.payload.clear();
        self.data.clear();
        self.metadata.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_parse_defaults_to_create() {
        assert_eq!(Operation::parse(""), Operation::Create);
        assert_eq!(Operation::parse("bogus"), Operation::Create);
        assert_eq!(Operation::parse("DELETE"), Operation::Delete);
    }

    #[test]
    fn ensure_data_from_after_materializes_object() {
        let mut msg = Message::default();
        msg.set_after(br#"{"id":"1","name":"John"}"#.to_vec());
        msg.ensure_data_from_after();
        assert_eq!(msg.data().get("name").unwrap().as_str(), Some("John"));
    }

    #[test]
    fn lsn_parses_metadata() {
        let mut msg = Message::default();
        assert_eq!(msg.lsn(), None);
        msg.set_metadata("lsn", "12345");
        assert_eq!(msg.lsn(), Some(12345));
    }
}
