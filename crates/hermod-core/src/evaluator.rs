//! A tiny, pure path evaluator over the structured view of a [`Message`]
//! (spec.md §9: "Dynamic field access").
//!
//! `get_msg_val_by_path(msg, "after.id")` walks `.`-separated segments
//! starting from one of the message's three JSON-shaped projections
//! (`data`, `after`, `before`) and returns the value found, or `None` if any
//! segment is missing. This is deliberately not a general JSONPath
//! implementation — just enough to resolve the dotted paths sink
//! configuration (`ColumnMapping::source_field`, SMTP template context, …)
//! is written against.

use serde_json::Value;

use crate::message::Message;

/// Resolve a dotted path against a message's `data`/`after`/`before`
/// projection. The first segment selects the projection:
/// - `data.<field>` → `Message::data()`
/// - `after.<field>` → `Message::after()` parsed as JSON
/// - `before.<field>` → `Message::before()` parsed as JSON
/// - a bare field name (no dot, no recognized prefix) is looked up in
///   `data` directly, so `"id"` and `"data.id"` are equivalent.
pub fn get_msg_val_by_path(msg: &Message, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;

    let (root, rest): (Value, Vec<&str>) = match head {
        "data" => (data_as_value(msg), segments.collect()),
        "after" => (bytes_as_value(msg.after()), segments.collect()),
        "before" => (bytes_as_value(msg.before()), segments.collect()),
        other => (data_as_value(msg), std::iter::once(other).chain(segments).collect()),
    };

    walk(&root, &rest).cloned()
}

fn data_as_value(msg: &Message) -> Value {
    Value::Object(msg.data().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn bytes_as_value(raw: &[u8]) -> Value {
    if raw.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(raw).unwrap_or(Value::Null)
    }
}

fn walk<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.get(*segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_after_path() {
        let mut msg = Message::default();
        msg.set_after(br#"{"id":"42","nested":{"v":1}}"#.to_vec());
        assert_eq!(
            get_msg_val_by_path(&msg, "after.id"),
            Some(Value::String("42".into()))
        );
        assert_eq!(
            get_msg_val_by_path(&msg, "after.nested.v"),
            Some(Value::from(1))
        );
    }

    #[test]
    fn bare_field_resolves_against_data() {
        let mut msg = Message::default();
        msg.data_mut().insert("name".into(), Value::String("Jane".into()));
        assert_eq!(
            get_msg_val_by_path(&msg, "name"),
            Some(Value::String("Jane".into()))
        );
        assert_eq!(
            get_msg_val_by_path(&msg, "data.name"),
            Some(Value::String("Jane".into()))
        );
    }

    #[test]
    fn missing_segment_is_none() {
        let msg = Message::default();
        assert_eq!(get_msg_val_by_path(&msg, "after.id"), None);
    }
}
