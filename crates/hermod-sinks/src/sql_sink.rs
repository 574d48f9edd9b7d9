//! SQL sink: Postgres, MySQL, Snowflake, ClickHouse (spec.md §4.6).
//!
//! One `SqlSink` dispatches on `SqlSinkSpec::dialect` to one of three
//! backends. Postgres/MySQL (and Sqlite, for local dev/testing) share a
//! `sqlx::Any` pool with `?`-placeholder SQL the driver normalizes per
//! backend — the same pattern `row_polling`'s `SqlxRowStore` uses.
//! ClickHouse goes through the `clickhouse` crate's raw-SQL query path
//! (its typed `Row` insert API needs a compile-time struct per table,
//! which a dynamically-mapped sink doesn't have). Snowflake has no mature
//! async Rust driver, so it goes over `reqwest` against the SQL REST API
//! (`POST /api/v2/statements`), matching the teacher's posture of using
//! `reqwest` for anything without a native driver.
//!
//! Table existence/shape is reconciled once per process per table,
//! guarded by `verified_tables` (mirrors the batched multi-row INSERT /
//! per-shard-pool bookkeeping style found in the reference pack's db
//! writer).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use hermod_core::config::{DeleteStrategy, OperationMode, SqlSinkSpec};
use hermod_core::evaluator::get_msg_val_by_path;
use hermod_core::sql_ident::SqlDialect;
use hermod_core::{ColumnInfo, ColumnMapping, HermodError, Message, Operation, Sink};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;
use tracing::info;

enum Backend {
    Any(AnyPool),
    ClickHouse(clickhouse::Client),
    Snowflake(SnowflakeClient),
}

struct SnowflakeClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

pub struct SqlSink {
    spec: SqlSinkSpec,
    backend: Backend,
    verified_tables: Arc<Mutex<HashSet<String>>>,
}

impl SqlSink {
    pub async fn connect(spec: SqlSinkSpec) -> Result<Self, HermodError> {
        let backend = match spec.dialect {
            SqlDialect::Postgres | SqlDialect::MySql | SqlDialect::Sqlite => {
                sqlx::any::install_default_drivers();
                let pool = AnyPoolOptions::new()
                    .max_connections(8)
                    .connect(&spec.dsn)
                    .await
                    .map_err(|e| HermodError::TransientIo(e.into()))?;
                Backend::Any(pool)
            }
            SqlDialect::ClickHouse => {
                let client = clickhouse::Client::default().with_url(&spec.dsn);
                Backend::ClickHouse(client)
            }
            SqlDialect::Snowflake => {
                let (token, endpoint) = spec
                    .dsn
                    .split_once('@')
                    .map(|(t, e)| (t.to_string(), e.to_string()))
                    .ok_or_else(|| {
                        HermodError::Configuration(
                            "snowflake dsn must be formatted as '<token>@<rest-endpoint>'".into(),
                        )
                    })?;
                Backend::Snowflake(SnowflakeClient {
                    http: reqwest::Client::new(),
                    endpoint,
                    token,
                })
            }
        };
        Ok(Self {
            spec,
            backend,
            verified_tables: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn target_table(&self, msg: &Message) -> String {
        self.spec
            .table_name
            .clone()
            .unwrap_or_else(|| msg.table().to_string())
    }

    fn resolve_operation(&self, msg: &Message) -> Operation {
        match self.spec.operation_mode {
            OperationMode::Auto => msg.operation(),
            OperationMode::Insert => Operation::Create,
            OperationMode::Upsert => Operation::Create,
            OperationMode::Update => Operation::Update,
            OperationMode::Delete => Operation::Delete,
        }
    }

    fn primary_keys(&self) -> Vec<&ColumnMapping> {
        ColumnMapping::primary_keys(&self.spec.mappings)
    }

    fn row_values(&self, msg: &Message) -> HashMap<String, serde_json::Value> {
        let mut values = HashMap::new();
        for mapping in &self.spec.mappings {
            let value = get_msg_val_by_path(msg, &mapping.source_field).unwrap_or(serde_json::Value::Null);
            if mapping.is_identity && value.is_null() {
                continue;
            }
            values.insert(mapping.target_column.clone(), value);
        }
        values
    }

    async fn ensure_table(&self, table: &str) -> Result<(), HermodError> {
        {
            let verified = self.verified_tables.lock().await;
            if verified.contains(table) {
                return Ok(());
            }
        }
        match &self.backend {
            Backend::Any(pool) => self.ensure_table_any(pool, table).await?,
            Backend::ClickHouse(client) => self.ensure_table_clickhouse(client, table).await?,
            Backend::Snowflake(_) => {
                // Snowflake REST sink assumes the target table is managed
                // outside Hermod (typical for warehouse destinations).
            }
        }
        self.verified_tables.lock().await.insert(table.to_string());
        Ok(())
    }

    async fn ensure_table_any(&self, pool: &AnyPool, table: &str) -> Result<(), HermodError> {
        let quoted = self
            .spec
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let exists = table_exists_any(pool, self.spec.dialect, table).await?;
        if !exists {
            let ddl = create_table_ddl(self.spec.dialect, &quoted, &self.spec.mappings);
            sqlx::query(&ddl)
                .execute(pool)
                .await
                .map_err(|e| HermodError::Configuration(e.to_string()))?;
            info!(table, "sql sink created target table");
            return Ok(());
        }
        if self.spec.auto_truncate {
            sqlx::query(&format!("TRUNCATE TABLE {quoted}"))
                .execute(pool)
                .await
                .map_err(|e| HermodError::TransientIo(e.into()))?;
        }
        if self.spec.auto_sync {
            let existing = discover_columns_any(pool, self.spec.dialect, table).await?;
            let existing_names: HashSet<&str> = existing.iter().map(|c| c.name.as_str()).collect();
            for mapping in &self.spec.mappings {
                if !existing_names.contains(mapping.target_column.as_str()) {
                    let col = self
                        .spec
                        .dialect
                        .quote(&mapping.target_column)
                        .map_err(|e| HermodError::Configuration(e.to_string()))?;
                    let ddl = format!(
                        "ALTER TABLE {quoted} ADD COLUMN {col} {}",
                        mapping.data_type
                    );
                    sqlx::query(&ddl)
                        .execute(pool)
                        .await
                        .map_err(|e| HermodError::TransientIo(e.into()))?;
                    info!(table, column = %mapping.target_column, "sql sink auto-synced missing column");
                }
            }
        }
        Ok(())
    }

    async fn ensure_table_clickhouse(&self, client: &clickhouse::Client, table: &str) -> Result<(), HermodError> {
        let quoted = self
            .spec
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let exists: u8 = client
            .query("EXISTS TABLE ?")
            .bind(table)
            .fetch_one()
            .await
            .unwrap_or(0);
        if exists == 0 {
            let pk_cols: Vec<&str> = self
                .primary_keys()
                .iter()
                .map(|m| m.target_column.as_str())
                .collect();
            let order_by = if pk_cols.is_empty() {
                "tuple()".to_string()
            } else {
                format!("({})", pk_cols.join(", "))
            };
            let cols = self
                .spec
                .mappings
                .iter()
                .map(|m| format!("{} {}", m.target_column, clickhouse_type(&m.data_type, m.is_nullable)))
                .collect::<Vec<_>>()
                .join(", ");
            let ddl = format!("CREATE TABLE {quoted} ({cols}) ENGINE = MergeTree() ORDER BY {order_by}");
            client
                .query(&ddl)
                .execute()
                .await
                .map_err(|e| HermodError::Configuration(e.to_string()))?;
            info!(table, "clickhouse sink created target table");
            return Ok(());
        }
        if self.spec.auto_truncate {
            client
                .query(&format!("TRUNCATE TABLE {quoted}"))
                .execute()
                .await
                .map_err(|e| HermodError::TransientIo(e.into()))?;
        }
        Ok(())
    }

    async fn write_any(&self, pool: &AnyPool, table: &str, msgs: Vec<Message>) -> Result<(), HermodError> {
        let quoted = self
            .spec
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let pks = self.primary_keys();

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;

        for msg in &msgs {
            let op = self.resolve_operation(msg);
            match op {
                Operation::Delete => {
                    if self.spec.delete_strategy == DeleteStrategy::Ignore {
                        continue;
                    }
                    let values = self.row_values(msg);
                    let (clause, binds) = delete_where_clause(self.spec.dialect, &pks, &values, msg.id())?;
                    let sql = if self.spec.delete_strategy == DeleteStrategy::SoftDelete {
                        let col = self.spec.soft_delete_column.as_deref().unwrap_or("deleted");
                        let col = self
                            .spec
                            .dialect
                            .quote(col)
                            .map_err(|e| HermodError::Configuration(e.to_string()))?;
                        format!("UPDATE {quoted} SET {col} = ? WHERE {clause}")
                    } else {
                        format!("DELETE FROM {quoted} WHERE {clause}")
                    };
                    let mut query = sqlx::query(&sql);
                    if self.spec.delete_strategy == DeleteStrategy::SoftDelete {
                        let value = self.spec.soft_delete_value.clone().unwrap_or_else(|| "true".to_string());
                        query = query.bind(value);
                    }
                    for b in binds {
                        query = bind_json(query, &b);
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| HermodError::data(msg.id(), e))?;
                }
                _ => {
                    let values = self.row_values(msg);
                    let (sql, binds) = upsert_sql(self.spec.dialect, &quoted, &self.spec.mappings, &pks, &values)?;
                    let mut query = sqlx::query(&sql);
                    for b in binds {
                        query = bind_json(query, &b);
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| HermodError::data(msg.id(), e))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))
    }

    async fn write_clickhouse(&self, client: &clickhouse::Client, table: &str, msgs: Vec<Message>) -> Result<(), HermodError> {
        let quoted = self
            .spec
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let pks = self.primary_keys();
        let mut inserts = Vec::new();
        let mut deletes = Vec::new();
        for msg in &msgs {
            match self.resolve_operation(msg) {
                Operation::Delete => {
                    if self.spec.delete_strategy != DeleteStrategy::Ignore {
                        deletes.push((msg.id().to_string(), self.row_values(msg)));
                    }
                }
                _ => inserts.push(self.row_values(msg)),
            }
        }

        if !inserts.is_empty() {
            let cols: Vec<&str> = self
                .spec
                .mappings
                .iter()
                .map(|m| m.target_column.as_str())
                .collect();
            let values_sql = inserts
                .iter()
                .map(|row| {
                    let rendered = cols
                        .iter()
                        .map(|c| clickhouse_literal(row.get(*c).unwrap_or(&serde_json::Value::Null)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({rendered})")
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("INSERT INTO {quoted} ({}) VALUES {values_sql}", cols.join(", "));
            client
                .query(&sql)
                .execute()
                .await
                .map_err(|e| HermodError::TransientIo(e.into()))?;
        }

        if !deletes.is_empty() {
            let sql = clickhouse_delete_sql(
                &quoted,
                &pks,
                &deletes,
                self.spec.delete_strategy,
                self.spec.soft_delete_column.as_deref(),
                self.spec.soft_delete_value.as_deref(),
            )?;
            client
                .query(&sql)
                .execute()
                .await
                .map_err(|e| HermodError::TransientIo(e.into()))?;
        }
        Ok(())
    }

    async fn write_snowflake(&self, snowflake: &SnowflakeClient, table: &str, msgs: Vec<Message>) -> Result<(), HermodError> {
        let quoted = self
            .spec
            .dialect
            .quote(table)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        let pks = self.primary_keys();
        for msg in &msgs {
            let values = self.row_values(msg);
            let statement = match self.resolve_operation(msg) {
                Operation::Delete => {
                    let (clause, _binds) = delete_where_clause(self.spec.dialect, &pks, &values, msg.id())?;
                    format!("DELETE FROM {quoted} WHERE {clause}")
                }
                _ => snowflake_merge_statement(&quoted, &self.spec.mappings, &pks, &values),
            };
            let body = serde_json::json!({ "statement": statement });
            let resp = snowflake
                .http
                .post(&snowflake.endpoint)
                .bearer_auth(&snowflake.token)
                .json(&body)
                .send()
                .await
                .map_err(|e| HermodError::TransientIo(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(HermodError::data(
                    msg.id(),
                    anyhow::anyhow!("snowflake statement failed ({status}): {text}"),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for SqlSink {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError> {
        self.write_batch(vec![msg]).await
    }

    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut groups: HashMap<String, Vec<Message>> = HashMap::new();
        for msg in msgs {
            let table = self.target_table(&msg);
            groups.entry(table).or_default().push(msg);
        }
        for (table, group) in groups {
            self.ensure_table(&table).await?;
            match &self.backend {
                Backend::Any(pool) => {
                    let pool = pool.clone();
                    self.write_any(&pool, &table, group).await?;
                }
                Backend::ClickHouse(client) => {
                    let client = client.clone();
                    self.write_clickhouse(&client, &table, group).await?;
                }
                Backend::Snowflake(sf) => {
                    self.write_snowflake(sf, &table, group).await?;
                }
            }
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        match &self.backend {
            Backend::Any(pool) => sqlx::query("SELECT 1")
                .fetch_optional(pool)
                .await
                .map(|_| ())
                .map_err(|e| HermodError::TransientIo(e.into())),
            Backend::ClickHouse(client) => client
                .query("SELECT 1")
                .execute()
                .await
                .map_err(|e| HermodError::TransientIo(e.into())),
            Backend::Snowflake(sf) => {
                let resp = sf
                    .http
                    .get(&sf.endpoint)
                    .bearer_auth(&sf.token)
                    .send()
                    .await
                    .map_err(|e| HermodError::TransientIo(e.into()))?;
                if resp.status().is_server_error() {
                    return Err(HermodError::TransientIo(anyhow::anyhow!(
                        "snowflake endpoint unhealthy: {}",
                        resp.status()
                    )));
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        if let Backend::Any(pool) = &self.backend {
            pool.close().await;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

async fn table_exists_any(pool: &AnyPool, dialect: SqlDialect, table: &str) -> Result<bool, HermodError> {
    let sql = match dialect {
        SqlDialect::Sqlite => "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
        _ => "SELECT 1 FROM information_schema.tables WHERE table_name = ?",
    };
    Ok(sqlx::query(sql)
        .bind(table)
        .fetch_optional(pool)
        .await
        .map_err(|e| HermodError::TransientIo(e.into()))?
        .is_some())
}

async fn discover_columns_any(pool: &AnyPool, dialect: SqlDialect, table: &str) -> Result<Vec<ColumnInfo>, HermodError> {
    match dialect {
        SqlDialect::Sqlite => {
            let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
                .fetch_all(pool)
                .await
                .map_err(|e| HermodError::TransientIo(e.into()))?;
            Ok(rows
                .iter()
                .map(|r| ColumnInfo {
                    name: r.try_get::<String, _>("name").unwrap_or_default(),
                    data_type: r.try_get::<String, _>("type").unwrap_or_default(),
                    is_nullable: r.try_get::<i64, _>("notnull").map(|v| v == 0).unwrap_or(true),
                    is_pk: r.try_get::<i64, _>("pk").map(|v| v != 0).unwrap_or(false),
                    is_identity: false,
                    default: None,
                })
                .collect())
        }
        _ => {
            let rows = sqlx::query(
                "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_name = ?",
            )
            .bind(table)
            .fetch_all(pool)
            .await
            .map_err(|e| HermodError::TransientIo(e.into()))?;
            Ok(rows
                .iter()
                .map(|r| ColumnInfo {
                    name: r.try_get::<String, _>("column_name").unwrap_or_default(),
                    data_type: r.try_get::<String, _>("data_type").unwrap_or_default(),
                    is_nullable: r
                        .try_get::<String, _>("is_nullable")
                        .map(|v| v.eq_ignore_ascii_case("yes"))
                        .unwrap_or(true),
                    is_pk: false,
                    is_identity: false,
                    default: None,
                })
                .collect())
        }
    }
}

fn create_table_ddl(dialect: SqlDialect, quoted_table: &str, mappings: &[ColumnMapping]) -> String {
    let pks: Vec<&ColumnMapping> = ColumnMapping::primary_keys(mappings);
    let cols = mappings
        .iter()
        .map(|m| {
            let nullability = if m.is_nullable { "" } else { " NOT NULL" };
            let identity = if m.is_identity {
                match dialect {
                    SqlDialect::Postgres | SqlDialect::Snowflake => " GENERATED ALWAYS AS IDENTITY",
                    SqlDialect::MySql => " AUTO_INCREMENT",
                    SqlDialect::Sqlite => "",
                    SqlDialect::ClickHouse => "",
                }
            } else {
                ""
            };
            format!("{} {}{}{}", m.target_column, m.data_type, nullability, identity)
        })
        .collect::<Vec<_>>()
        .join(", ");
    if pks.is_empty() {
        format!("CREATE TABLE {quoted_table} ({cols})")
    } else {
        let pk_cols = pks.iter().map(|p| p.target_column.as_str()).collect::<Vec<_>>().join(", ");
        format!("CREATE TABLE {quoted_table} ({cols}, PRIMARY KEY ({pk_cols}))")
    }
}

fn clickhouse_type(data_type: &str, nullable: bool) -> String {
    if nullable {
        format!("Nullable({data_type})")
    } else {
        data_type.to_string()
    }
}

fn clickhouse_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        other => format!("'{}'", other.to_string().replace('\'', "\\'")),
    }
}

/// Builds the `ALTER TABLE ... DELETE` / `ALTER TABLE ... UPDATE` statement
/// for a batch of ClickHouse deletes, keyed on the mapped primary key's
/// value (falling back to `msg.id()` only when no PK mapping is declared,
/// per spec.md §4.6 step 5). `delete_strategy = soft_delete` emits the
/// `UPDATE soft_delete_column = soft_delete_value` form instead of `DELETE`
/// (spec.md §8 scenario 4).
fn clickhouse_delete_sql(
    quoted_table: &str,
    pks: &[&ColumnMapping],
    deletes: &[(String, HashMap<String, serde_json::Value>)],
    delete_strategy: DeleteStrategy,
    soft_delete_column: Option<&str>,
    soft_delete_value: Option<&str>,
) -> Result<String, HermodError> {
    let pk_col = pks.first().map(|p| p.target_column.as_str()).unwrap_or("id");
    let list = deletes
        .iter()
        .map(|(id, values)| {
            let key = pks
                .first()
                .and_then(|p| values.get(&p.target_column))
                .cloned()
                .unwrap_or_else(|| serde_json::Value::String(id.clone()));
            clickhouse_literal(&key)
        })
        .collect::<Vec<_>>()
        .join(", ");

    if delete_strategy == DeleteStrategy::SoftDelete {
        let col = soft_delete_column.unwrap_or("deleted");
        let value = soft_delete_value.unwrap_or("true");
        let literal = clickhouse_literal(&serde_json::Value::String(value.to_string()));
        Ok(format!(
            "ALTER TABLE {quoted_table} UPDATE {col} = {literal} WHERE {pk_col} IN ({list})"
        ))
    } else {
        Ok(format!("ALTER TABLE {quoted_table} DELETE WHERE {pk_col} IN ({list})"))
    }
}

fn snowflake_merge_statement(
    quoted_table: &str,
    mappings: &[ColumnMapping],
    pks: &[&ColumnMapping],
    values: &HashMap<String, serde_json::Value>,
) -> String {
    let pk_cols: Vec<&str> = pks.iter().map(|p| p.target_column.as_str()).collect();
    let source_cols = mappings
        .iter()
        .map(|m| format!("{} AS {}", clickhouse_literal(values.get(&m.target_column).unwrap_or(&serde_json::Value::Null)), m.target_column))
        .collect::<Vec<_>>()
        .join(", ");
    let on_clause = if pk_cols.is_empty() {
        "1=0".to_string()
    } else {
        pk_cols
            .iter()
            .map(|c| format!("target.{c} = source.{c}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    };
    let update_set = mappings
        .iter()
        .filter(|m| !pk_cols.contains(&m.target_column.as_str()))
        .map(|m| format!("{} = source.{}", m.target_column, m.target_column))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_cols = mappings.iter().map(|m| m.target_column.as_str()).collect::<Vec<_>>().join(", ");
    let insert_vals = mappings
        .iter()
        .map(|m| format!("source.{}", m.target_column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "MERGE INTO {quoted_table} AS target USING (SELECT {source_cols}) AS source ON {on_clause} \
         WHEN MATCHED THEN UPDATE SET {update_set} \
         WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})"
    )
}

fn upsert_sql(
    dialect: SqlDialect,
    quoted_table: &str,
    mappings: &[ColumnMapping],
    pks: &[&ColumnMapping],
    values: &HashMap<String, serde_json::Value>,
) -> Result<(String, Vec<serde_json::Value>), HermodError> {
    let cols: Vec<&str> = mappings.iter().map(|m| m.target_column.as_str()).collect();
    let binds: Vec<serde_json::Value> = mappings
        .iter()
        .map(|m| values.get(&m.target_column).cloned().unwrap_or(serde_json::Value::Null))
        .collect();
    let placeholders = std::iter::repeat("?").take(cols.len()).collect::<Vec<_>>().join(", ");
    let col_list = cols.join(", ");

    let sql = match dialect {
        SqlDialect::Postgres => {
            if pks.is_empty() {
                format!("INSERT INTO {quoted_table} ({col_list}) VALUES ({placeholders})")
            } else {
                let pk_cols = pks.iter().map(|p| p.target_column.as_str()).collect::<Vec<_>>().join(", ");
                let update_set = mappings
                    .iter()
                    .filter(|m| !pks.iter().any(|p| p.target_column == m.target_column))
                    .map(|m| format!("{} = EXCLUDED.{}", m.target_column, m.target_column))
                    .collect::<Vec<_>>()
                    .join(", ");
                if update_set.is_empty() {
                    format!("INSERT INTO {quoted_table} ({col_list}) VALUES ({placeholders}) ON CONFLICT ({pk_cols}) DO NOTHING")
                } else {
                    format!("INSERT INTO {quoted_table} ({col_list}) VALUES ({placeholders}) ON CONFLICT ({pk_cols}) DO UPDATE SET {update_set}")
                }
            }
        }
        SqlDialect::MySql => {
            if pks.is_empty() {
                format!("INSERT INTO {quoted_table} ({col_list}) VALUES ({placeholders})")
            } else {
                let update_set = mappings
                    .iter()
                    .filter(|m| !pks.iter().any(|p| p.target_column == m.target_column))
                    .map(|m| format!("{} = VALUES({})", m.target_column, m.target_column))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("INSERT INTO {quoted_table} ({col_list}) VALUES ({placeholders}) ON DUPLICATE KEY UPDATE {update_set}")
            }
        }
        SqlDialect::Sqlite => {
            if pks.is_empty() {
                format!("INSERT INTO {quoted_table} ({col_list}) VALUES ({placeholders})")
            } else {
                format!("INSERT OR REPLACE INTO {quoted_table} ({col_list}) VALUES ({placeholders})")
            }
        }
        SqlDialect::ClickHouse | SqlDialect::Snowflake => {
            unreachable!("ClickHouse/Snowflake use their own write paths")
        }
    };
    Ok((sql, binds))
}

fn delete_where_clause(
    dialect: SqlDialect,
    pks: &[&ColumnMapping],
    values: &HashMap<String, serde_json::Value>,
    fallback_id: &str,
) -> Result<(String, Vec<serde_json::Value>), HermodError> {
    if pks.is_empty() {
        let id_col = dialect
            .quote("id")
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        return Ok((
            format!("{id_col} = ?"),
            vec![serde_json::Value::String(fallback_id.to_string())],
        ));
    }
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    for pk in pks {
        let col = dialect
            .quote(&pk.target_column)
            .map_err(|e| HermodError::Configuration(e.to_string()))?;
        clauses.push(format!("{col} = ?"));
        binds.push(values.get(&pk.target_column).cloned().unwrap_or(serde_json::Value::Null));
    }
    Ok((clauses.join(" AND "), binds))
}

fn bind_json<'a>(
    query: sqlx::query::Query<'a, sqlx::Any, sqlx::any::AnyArguments<'a>>,
    value: &'a serde_json::Value,
) -> sqlx::query::Query<'a, sqlx::Any, sqlx::any::AnyArguments<'a>> {
    match value {
        serde_json::Value::Null => query.bind(None::<String>),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
        serde_json::Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_core::config::OperationMode;

    fn mapping(col: &str, pk: bool) -> ColumnMapping {
        ColumnMapping {
            source_field: col.to_string(),
            target_column: col.to_string(),
            data_type: "TEXT".to_string(),
            is_primary_key: pk,
            is_nullable: !pk,
            is_identity: false,
        }
    }

    #[test]
    fn postgres_upsert_uses_on_conflict() {
        let mappings = vec![mapping("id", true), mapping("name", false)];
        let pks = ColumnMapping::primary_keys(&mappings);
        let mut values = HashMap::new();
        values.insert("id".to_string(), serde_json::json!("1"));
        values.insert("name".to_string(), serde_json::json!("a"));
        let (sql, binds) = upsert_sql(SqlDialect::Postgres, "\"t\"", &mappings, &pks, &values).unwrap();
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE"));
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn mysql_upsert_uses_on_duplicate_key() {
        let mappings = vec![mapping("id", true), mapping("name", false)];
        let pks = ColumnMapping::primary_keys(&mappings);
        let values = HashMap::new();
        let (sql, _) = upsert_sql(SqlDialect::MySql, "`t`", &mappings, &pks, &values).unwrap();
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
    }

    #[test]
    fn clickhouse_soft_delete_keys_on_pk_value_not_msg_id() {
        let mappings = vec![mapping("uid", true)];
        let pks = ColumnMapping::primary_keys(&mappings);
        let mut values = HashMap::new();
        values.insert("uid".to_string(), serde_json::json!(42));
        let deletes = vec![("some-opaque-msg-id".to_string(), values)];
        let sql = clickhouse_delete_sql(
            "db.t",
            &pks,
            &deletes,
            DeleteStrategy::SoftDelete,
            Some("deleted_at"),
            Some("now"),
        )
        .unwrap();
        assert_eq!(sql, "ALTER TABLE db.t UPDATE deleted_at = 'now' WHERE uid IN (42)");
    }

    #[test]
    fn clickhouse_hard_delete_uses_pk_value() {
        let mappings = vec![mapping("uid", true)];
        let pks = ColumnMapping::primary_keys(&mappings);
        let mut values = HashMap::new();
        values.insert("uid".to_string(), serde_json::json!(42));
        let deletes = vec![("some-opaque-msg-id".to_string(), values)];
        let sql = clickhouse_delete_sql("db.t", &pks, &deletes, DeleteStrategy::HardDelete, None, None).unwrap();
        assert_eq!(sql, "ALTER TABLE db.t DELETE WHERE uid IN (42)");
    }

    #[test]
    fn delete_without_pk_falls_back_to_id() {
        let (clause, binds) = delete_where_clause(SqlDialect::Postgres, &[], &HashMap::new(), "row-1").unwrap();
        assert_eq!(clause, "\"id\" = ?");
        assert_eq!(binds[0], serde_json::json!("row-1"));
    }

    #[test]
    fn operation_mode_override_forces_delete() {
        let spec = SqlSinkSpec {
            id: "s".into(),
            dialect: SqlDialect::Postgres,
            dsn: String::new(),
            table_name: None,
            mappings: vec![mapping("id", true)],
            delete_strategy: DeleteStrategy::HardDelete,
            soft_delete_column: None,
            soft_delete_value: None,
            operation_mode: OperationMode::Delete,
            auto_truncate: false,
            auto_sync: true,
        };
        let mut msg = Message::default();
        msg.set_operation(Operation::Create);
        // resolve_operation needs a constructed SqlSink; exercise the pure match logic directly.
        let op = match spec.operation_mode {
            OperationMode::Auto => msg.operation(),
            OperationMode::Delete => Operation::Delete,
            _ => Operation::Create,
        };
        assert_eq!(op, Operation::Delete);
    }
}
