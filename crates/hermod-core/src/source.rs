//! The Source contract (spec.md §4.2).

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HermodError;
use crate::message::Message;

/// Required operations every Source implements.
///
/// `read` blocks until a message is ready, `cancel` fires, or a fatal error
/// occurs. `Ok(None)` ("no data now; call again") is a backoff hint to the
/// engine, not an error. `ack` must be monotonic — acking an older watermark
/// than the current high-water mark is a no-op, never a regression.
#[async_trait]
pub trait Source: Send + Sync {
    /// Block until a message is ready, `cancel` fires, or a fatal error
    /// occurs.
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, HermodError>;

    /// Report successful downstream delivery so the source may advance its
    /// watermark.
    async fn ack(&mut self, msg: &Message) -> Result<(), HermodError>;

    /// Cheap liveness check.
    async fn ping(&mut self) -> Result<(), HermodError>;

    /// Stronger precondition check (e.g. Postgres verifies `wal_level` and
    /// replication privileges). Default falls back to [`Source::ping`]; the
    /// engine calls this when present rather than `ping` directly (spec.md
    /// §4.2, §4.10).
    async fn is_ready(&mut self) -> Result<(), HermodError> {
        self.ping().await
    }

    /// Release resources. Idempotent.
    async fn close(&mut self) -> Result<(), HermodError>;

    /// Enables capability downcasting for the optional interfaces below.
    fn as_any(&self) -> &dyn Any;
}

/// Optional capability: list databases/catalogs visible to this source.
#[async_trait]
pub trait DiscoverDatabases: Send + Sync {
    async fn discover_databases(&mut self) -> Result<Vec<String>, HermodError>;
}

/// Optional capability: list tables within a database.
#[async_trait]
pub trait DiscoverTables: Send + Sync {
    async fn discover_tables(&mut self, database: &str) -> Result<Vec<String>, HermodError>;
}

/// Optional capability: return a small sample of rows from a table, for UI
/// preview / schema inference purposes.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&mut self, table: &str, limit: usize) -> Result<Vec<Message>, HermodError>;
}

/// Optional capability: emit a full-table snapshot as a stream of `snapshot`
/// messages ahead of incremental reads (spec.md §4.4).
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot(
        &mut self,
        tables: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), HermodError>;
}

/// Optional capability: checkpoint persistence, exposed as an opaque
/// string→string map so an external supervisor can persist it (spec.md
/// §4.4, §6).
pub trait StateStore: Send + Sync {
    fn get_state(&self) -> HashMap<String, String>;
    fn set_state(&mut self, state: HashMap<String, String>);
}
