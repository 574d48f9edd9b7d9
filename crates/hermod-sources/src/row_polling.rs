//! Row-polling source pattern (spec.md §4.4): watermark-by-cursor reads for
//! read-store sources (SQLite, MySQL/MariaDB and friends).
//!
//! `RowStore` is the dialect-generic backend trait; `RowPollingSource`
//! implements [`Source`] + [`Snapshotter`] + [`StateStore`] against any
//! `RowStore`. Concrete `sqlx`-backed stores for SQLite and MySQL are
//! provided here; a DB2/ScyllaDB backend would implement the same trait
//! but needs a vendor driver this corpus doesn't carry (DESIGN.md notes
//! this as a deliberate extension point, not an oversight).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hermod_core::config::RowStoreKind;
use hermod_core::source::{Snapshotter, StateStore};
use hermod_core::sql_ident::SqlDialect;
use hermod_core::{HermodError, Message, Operation, Source};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row, TypeInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One row read from a polled table, keyed by its cursor column.
pub struct PolledRow {
    pub cursor_value: String,
    pub row: HashMap<String, serde_json::Value>,
}

/// Backend abstraction over the row-store being polled. Implementations own
/// connection pooling; `RowPollingSource` only drives the cursor protocol.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Fetch at most one row from `table` with cursor strictly greater than
    /// `after`, ordered by the cursor column ascending.
    async fn poll_next(&self, table: &str, id_field: &str, after: &str) -> Result<Option<PolledRow>, HermodError>;

    /// Scan `table` in full, in cursor order, for snapshot mode.
    async fn scan_all(&self, table: &str, id_field: &str) -> Result<Vec<PolledRow>, HermodError>;

    async fn ping(&self) -> Result<(), HermodError>;
}

pub struct SqlxRowStore {
    pool: AnyPool,
    dialect: SqlDialect,
}

impl SqlxRowStore {
    pub async fn connect(kind: RowStoreKind, dsn: &str) -> Result<Self, HermodError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(4)
            .connect(dsn)
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        let dialect = match kind {
            RowStoreKind::Sqlite => SqlDialect::Sqlite,
            RowStoreKind::MySql => SqlDialect::MySql,
            RowStoreKind::Postgres => SqlDialect::Postgres,
        };
        Ok(Self { pool, dialect })
    }

    fn row_to_json(row: &AnyRow) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        for col in row.columns() {
            let name = col.name().to_string();
            let value = decode_any_value(row, col.ordinal(), col.type_info().name());
            map.insert(name, value);
        }
        map
    }
}

fn decode_any_value(row: &AnyRow, idx: usize, type_name: &str) -> serde_json::Value {
    // `sqlx::Any` exposes a narrow value surface; decode by declared type
    // name and fall back to string representation for anything exotic.
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return serde_json::json!(v);
    }
    debug!(type_name, "column decoded as null (unsupported type)");
    serde_json::Value::Null
}

#[async_trait]
impl RowStore for SqlxRowStore {
    async fn poll_next(&self, table: &str, id_field: &str, after: &str) -> Result<Option<PolledRow>, HermodError> {
        let quoted_table = self
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let quoted_id = self
            .dialect
            .quote(id_field)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let sql = format!(
            "SELECT * FROM {quoted_table} WHERE {quoted_id} > ? ORDER BY {quoted_id} LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(after)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        Ok(row.map(|r| {
            let data = Self::row_to_json(&r);
            let cursor_value = data
                .get(id_field)
                .map(value_to_cursor_string)
                .unwrap_or_default();
            PolledRow { cursor_value, row: data }
        }))
    }

    async fn scan_all(&self, table: &str, id_field: &str) -> Result<Vec<PolledRow>, HermodError> {
        let quoted_table = self
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let quoted_id = self
            .dialect
            .quote(id_field)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let sql = format!("SELECT * FROM {quoted_table} ORDER BY {quoted_id} ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
        Ok(rows
            .iter()
            .map(|r| {
                let data = Self::row_to_json(r);
                let cursor_value = data
                    .get(id_field)
                    .map(value_to_cursor_string)
                    .unwrap_or_default();
                PolledRow { cursor_value, row: data }
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), HermodError> {
        sqlx::query("SELECT 1")
            .fetch_optional(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| HermodError::TransientIo(e.into()))
    }
}

fn value_to_cursor_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct RowPollingSource<S: RowStore> {
    store: S,
    tables: Vec<String>,
    id_field: String,
    poll_interval: Duration,
    last_id: HashMap<String, String>,
    snapshot_queue: Option<mpsc::Receiver<Message>>,
    cursor_at_table: usize,
}

impl<S: RowStore> RowPollingSource<S> {
    pub fn new(store: S, tables: Vec<String>, id_field: String, poll_interval: Duration) -> Self {
        let last_id = tables.iter().map(|t| (t.clone(), String::new())).collect();
        Self {
            store,
            tables,
            id_field,
            poll_interval,
            last_id,
            snapshot_queue: None,
            cursor_at_table: 0,
        }
    }

    fn row_to_message(&self, table: &str, polled: PolledRow) -> Message {
        let mut msg = Message::default();
        msg.set_operation(Operation::Create)
            .set_table(table.to_string())
            .set_id(polled.cursor_value.clone())
            .set_metadata("source", "row_polling")
            .set_metadata(format!("last_id:{table}"), polled.cursor_value.clone());
        msg.set_after(serde_json::to_vec(&polled.row).unwrap_or_default());
        msg.set_data(polled.row);
        msg
    }
}

#[async_trait]
impl<S: RowStore> Source for RowPollingSource<S> {
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, HermodError> {
        if let Some(queue) = &mut self.snapshot_queue {
            match queue.recv().await {
                Some(msg) => return Ok(Some(msg)),
                None => self.snapshot_queue = None,
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let n = self.tables.len();
            for offset in 0..n {
                let idx = (self.cursor_at_table + offset) % n;
                let table = self.tables[idx].clone();
                let after = self.last_id.get(&table).cloned().unwrap_or_default();
                match self.store.poll_next(&table, &self.id_field, &after).await {
                    Ok(Some(polled)) => {
                        self.cursor_at_table = (idx + 1) % n;
                        return Ok(Some(self.row_to_message(&table, polled)));
                    }
                    Ok(None) => continue,
                    Err(e) if e.is_configuration() => return Err(e),
                    Err(e) => {
                        warn!(table, error = %e, "row poll failed, continuing to next table");
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    async fn ack(&mut self, msg: &Message) -> Result<(), HermodError> {
        let table = msg.table();
        if let Some(new_id) = msg.metadata_get(&format!("last_id:{table}")) {
            let entry = self.last_id.entry(table.to_string()).or_default();
            if new_id > entry.as_str() {
                *entry = new_id.to_string();
            }
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        self.store.ping().await
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        self.snapshot_queue = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl<S: RowStore> Snapshotter for RowPollingSource<S> {
    async fn snapshot(&mut self, tables: &[String], cancel: &CancellationToken) -> Result<(), HermodError> {
        let (tx, rx) = mpsc::channel(256);
        for table in tables {
            if cancel.is_cancelled() {
                break;
            }
            let rows = self.store.scan_all(table, &self.id_field).await?;
            for polled in rows {
                let mut msg = self.row_to_message(table, polled);
                msg.set_operation(Operation::Snapshot);
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
        self.snapshot_queue = Some(rx);
        Ok(())
    }
}

impl<S: RowStore> StateStore for RowPollingSource<S> {
    fn get_state(&self) -> HashMap<String, String> {
        self.last_id
            .iter()
            .map(|(table, id)| (format!("last_id:{table}"), id.clone()))
            .collect()
    }

    fn set_state(&mut self, state: HashMap<String, String>) {
        for (key, value) in state {
            if let Some(table) = key.strip_prefix("last_id:") {
                self.last_id.insert(table.to_string(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        rows: StdMutex<HashMap<String, Vec<(String, serde_json::Value)>>>,
    }

    #[async_trait]
    impl RowStore for FakeStore {
        async fn poll_next(&self, table: &str, _id_field: &str, after: &str) -> Result<Option<PolledRow>, HermodError> {
            let rows = self.rows.lock().unwrap();
            let Some(table_rows) = rows.get(table) else { return Ok(None) };
            for (id, value) in table_rows {
                if id.as_str() > after {
                    let mut map = HashMap::new();
                    map.insert("id".to_string(), value.clone());
                    return Ok(Some(PolledRow { cursor_value: id.clone(), row: map }));
                }
            }
            Ok(None)
        }

        async fn scan_all(&self, table: &str, _id_field: &str) -> Result<Vec<PolledRow>, HermodError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .map(|(id, value)| {
                            let mut map = HashMap::new();
                            map.insert("id".to_string(), value.clone());
                            PolledRow { cursor_value: id.clone(), row: map }
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn ping(&self) -> Result<(), HermodError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn advances_watermark_only_after_ack() {
        let mut rows = HashMap::new();
        rows.insert(
            "t".to_string(),
            vec![
                ("1".to_string(), serde_json::json!("a")),
                ("2".to_string(), serde_json::json!("b")),
            ],
        );
        let store = FakeStore { rows: StdMutex::new(rows) };
        let mut source = RowPollingSource::new(store, vec!["t".to_string()], "id".to_string(), Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let msg1 = source.read(&cancel).await.unwrap().unwrap();
        assert_eq!(msg1.id(), "1");
        // Before ack, re-reading the same table should still yield id "1" is already past,
        // so the next distinct row is "2" once we've acked "1".
        source.ack(&msg1).await.unwrap();
        let msg2 = source.read(&cancel).await.unwrap().unwrap();
        assert_eq!(msg2.id(), "2");
    }

    #[tokio::test]
    async fn state_round_trips() {
        let store = FakeStore { rows: StdMutex::new(HashMap::new()) };
        let mut source = RowPollingSource::new(store, vec!["t".to_string()], "id".to_string(), Duration::from_millis(10));
        source.set_state(HashMap::from([("last_id:t".to_string(), "5".to_string())]));
        assert_eq!(source.get_state().get("last_id:t").unwrap(), "5");
    }
}
