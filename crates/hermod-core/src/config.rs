//! Pipeline configuration, loaded from YAML (spec.md §2, §4.6, §6).
//!
//! A deployment is configured with exactly one source and one or more
//! sinks, mirroring the teacher workspace's `PipelineSpec`/`SourceSpec`/
//! `SinkSpec` shape (`rde_core::PipelineSpec`) but adapted to Hermod's
//! pull/push Source-Engine-Sink contract instead of a push-style operator
//! graph.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::column::ColumnMapping;
use crate::sql_ident::SqlDialect;

/// Top-level deployment specification: one source, one or more sinks, and
/// the engine's batching/backoff tunables.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineSpec {
    pub name: String,
    pub source: SourceSpec,
    #[validate(length(min = 1, message = "at least one sink must be configured"))]
    pub sinks: Vec<SinkSpec>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl PipelineSpec {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let spec: PipelineSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }
}

/// Engine-level tunables (spec.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "humantime_duration")]
    pub reconnect_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub status_interval: Duration,
    #[validate(range(min = 1, message = "batch_size must be positive"))]
    pub batch_size: usize,
    #[serde(with = "humantime_duration")]
    pub batch_timeout: Duration,
    pub ring_buffer_capacity: usize,
    pub max_retries: u32,
    #[serde(with = "humantime_duration")]
    pub retry_backoff_initial: Duration,
    #[serde(with = "humantime_duration")]
    pub retry_backoff_max: Duration,
    pub metrics_addr: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(30),
            batch_size: 500,
            batch_timeout: Duration::from_millis(500),
            ring_buffer_capacity: 4096,
            max_retries: 5,
            retry_backoff_initial: Duration::from_millis(200),
            retry_backoff_max: Duration::from_secs(30),
            metrics_addr: None,
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    PostgresCdc(PostgresCdcSourceSpec),
    RowPolling(RowPollingSourceSpec),
    Csv(CsvSourceSpec),
    Kafka(KafkaSourceSpec),
    Webhook(WebhookSourceSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PostgresCdcSourceSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub dsn: String,
    pub publication: String,
    pub slot: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub slot_transient: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowStoreKind {
    Sqlite,
    MySql,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RowPollingSourceSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub kind: RowStoreKind,
    pub dsn: String,
    #[validate(length(min = 1, message = "at least one table must be configured"))]
    pub tables: Vec<String>,
    pub id_field: String,
    #[serde(with = "humantime_duration", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CsvSourceSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub has_header: bool,
    #[serde(default)]
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KafkaSourceSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WebhookSourceSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub listen_addr: String,
    pub path: String,
    #[serde(default)]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStrategy {
    HardDelete,
    SoftDelete,
    Ignore,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Auto,
    Insert,
    Upsert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SqlSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub dialect: SqlDialect,
    pub dsn: String,
    pub table_name: Option<String>,
    #[validate(length(min = 1, message = "at least one column mapping must be configured"))]
    pub mappings: Vec<ColumnMapping>,
    #[serde(default = "default_delete_strategy")]
    pub delete_strategy: DeleteStrategy,
    #[serde(default)]
    pub soft_delete_column: Option<String>,
    #[serde(default)]
    pub soft_delete_value: Option<String>,
    #[serde(default)]
    pub operation_mode: OperationMode,
    #[serde(default)]
    pub auto_truncate: bool,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
}

fn default_delete_strategy() -> DeleteStrategy {
    DeleteStrategy::HardDelete
}

fn default_true() -> bool {
    true
}

impl Default for OperationMode {
    fn default() -> Self {
        OperationMode::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MongoSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub uri: String,
    pub database: String,
    pub collection: Option<String>,
    #[serde(default)]
    pub mappings: Vec<ColumnMapping>,
    #[serde(default)]
    pub soft_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KafkaSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub brokers: String,
    pub topic: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmtpIdempotencyPolicy {
    ClaimBeforeSend,
    ClaimAfterSend,
}

impl Default for SmtpIdempotencyPolicy {
    fn default() -> Self {
        SmtpIdempotencyPolicy::ClaimBeforeSend
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    Inline,
    Url,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SmtpSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub smtp_url: String,
    pub from: String,
    pub to_field: String,
    pub subject_template: String,
    pub body_template: String,
    pub template_source: TemplateSource,
    #[serde(default)]
    pub idempotency_enabled: bool,
    #[serde(default)]
    pub idempotency_key_template: Option<String>,
    #[serde(default)]
    pub idempotency_policy: SmtpIdempotencyPolicy,
    pub idempotency_db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HttpSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub ping_method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub batch_as_array: bool,
}

fn default_post() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PineconeSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub base_url: String,
    pub api_key: String,
    pub namespace: Option<String>,
    pub vector_field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MilvusSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub base_url: String,
    pub collection: String,
    pub id_field: String,
    pub vector_field: String,
    #[serde(default)]
    pub mappings: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FtpSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub remote_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StdoutSinkSpec {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    Sql(SqlSinkSpec),
    Mongo(MongoSinkSpec),
    Kafka(KafkaSinkSpec),
    Smtp(SmtpSinkSpec),
    Http(HttpSinkSpec),
    Pinecone(PineconeSinkSpec),
    Milvus(MilvusSinkSpec),
    Ftp(FtpSinkSpec),
    Stdout(StdoutSinkSpec),
}

impl SinkSpec {
    pub fn id(&self) -> &str {
        match self {
            SinkSpec::Sql(s) => &s.id,
            SinkSpec::Mongo(s) => &s.id,
            SinkSpec::Kafka(s) => &s.id,
            SinkSpec::Smtp(s) => &s.id,
            SinkSpec::Http(s) => &s.id,
            SinkSpec::Pinecone(s) => &s.id,
            SinkSpec::Milvus(s) => &s.id,
            SinkSpec::Ftp(s) => &s.id,
            SinkSpec::Stdout(s) => &s.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_csv_to_stdout_pipeline() {
        let yaml = r#"
name: csv-to-stdout
source:
  type: csv
  id: csv-in
  path: "data.csv"
  has_header: true
sinks:
  - type: stdout
    id: out
"#;
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.name, "csv-to-stdout");
        assert_eq!(spec.sinks.len(), 1);
        assert_eq!(spec.engine.batch_size, 500);
    }

    #[test]
    fn rejects_empty_sinks() {
        let yaml = r#"
name: no-sinks
source:
  type: csv
  id: csv-in
  path: "data.csv"
sinks: []
"#;
        let err = PipelineSpec::from_yaml(yaml);
        assert!(err.is_err());
    }
}
