//! The Sink contract (spec.md §4.5).

use std::any::Any;

use async_trait::async_trait;

use crate::column::ColumnInfo;
use crate::error::HermodError;
use crate::message::Message;

/// Required operations every Sink implements.
///
/// All sinks must drop `None`/already-filtered messages before they reach
/// here, treat an empty batch as success, and never retain a [`Message`]
/// past this call returning.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&mut self, msg: Message) -> Result<(), HermodError>;

    /// Default batching strategy: loop over `write`. SQL and broker sinks
    /// override this to batch natively (spec.md §4.5).
    async fn write_batch(&mut self, msgs: Vec<Message>) -> Result<(), HermodError> {
        if msgs.is_empty() {
            return Ok(());
        }
        for msg in msgs {
            self.write(msg).await?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError>;

    async fn close(&mut self) -> Result<(), HermodError>;

    fn as_any(&self) -> &dyn Any;
}

/// The result of a delivery attempt, used by sinks that support
/// [`LastWriteIdempotent`] to report conflicts without treating them as
/// engine-level errors (spec.md §4.5, §7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub dedup: bool,
    pub conflict: bool,
}

/// Optional capability: report whether the most recent write was
/// deduplicated or lost a mutual-exclusion race, rather than an error.
pub trait LastWriteIdempotent: Send + Sync {
    fn last_write_idempotent(&self) -> DeliveryOutcome;
}

/// Optional capability: list databases/catalogs visible to this sink.
#[async_trait]
pub trait DiscoverDatabases: Send + Sync {
    async fn discover_databases(&mut self) -> Result<Vec<String>, HermodError>;
}

/// Optional capability: list tables within a database.
#[async_trait]
pub trait DiscoverTables: Send + Sync {
    async fn discover_tables(&mut self, database: &str) -> Result<Vec<String>, HermodError>;
}

/// Optional capability: describe the columns of an existing target table,
/// used by auto-sync to diff against configured `ColumnMapping`s.
#[async_trait]
pub trait DiscoverColumns: Send + Sync {
    async fn discover_columns(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, HermodError>;
}

/// Optional capability: two-phase-commit hooks for sinks whose driver
/// supports a transactional handshake. Per spec.md §9's open question, a
/// sink either implements these with real transactional semantics or omits
/// the trait entirely — a no-op implementation that claims to support 2PC
/// while doing nothing is explicitly disallowed.
#[async_trait]
pub trait TwoPhaseCommit: Send + Sync {
    async fn begin(&mut self) -> Result<(), HermodError>;
    async fn prepare(&mut self) -> Result<(), HermodError>;
    async fn commit(&mut self) -> Result<(), HermodError>;
    async fn rollback(&mut self) -> Result<(), HermodError>;
}
