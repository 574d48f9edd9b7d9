//! Sink-side schema translation descriptors (spec.md §3).

use serde::{Deserialize, Serialize};

/// Describes how one field of `Message::data`/`Message::after` maps onto a
/// column of the sink's target schema. A list of these per sink defines the
/// whole translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_field: String,
    pub target_column: String,
    pub data_type: String,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default = "default_nullable")]
    pub is_nullable: bool,
    #[serde(default)]
    pub is_identity: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnMapping {
    pub fn primary_keys(mappings: &[ColumnMapping]) -> Vec<&ColumnMapping> {
        mappings.iter().filter(|m| m.is_primary_key).collect()
    }
}

/// The shape of a column as discovered on the sink's existing target schema,
/// used by auto-sync to diff against configured [`ColumnMapping`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub is_nullable: bool,
    pub is_pk: bool,
    pub is_identity: bool,
    pub default: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_keys_filters() {
        let mappings = vec![
            ColumnMapping {
                source_field: "id".into(),
                target_column: "id".into(),
                data_type: "text".into(),
                is_primary_key: true,
                is_nullable: false,
                is_identity: false,
            },
            ColumnMapping {
                source_field: "v".into(),
                target_column: "v".into(),
                data_type: "int".into(),
                is_primary_key: false,
                is_nullable: true,
                is_identity: false,
            },
        ];
        let pks = ColumnMapping::primary_keys(&mappings);
        assert_eq!(pks.len(), 1);
        assert_eq!(pks[0].target_column, "id");
    }
}
