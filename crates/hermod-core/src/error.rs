//! Error taxonomy shared across Hermod components (spec.md §7).
//!
//! This is a taxonomy, not a type hierarchy of product-specific error
//! structs: every source/sink maps its driver errors onto one of these
//! variants so the engine can apply a uniform propagation policy without
//! knowing about `sqlx`, `rdkafka`, or `tokio_postgres` directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HermodError {
    /// Fatal, surfaced by `IsReady`: missing privilege, `wal_level` not
    /// logical, invalid identifier, missing credential.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Retried locally up to 3x then surfaced for engine-level backoff:
    /// connection reset, timeout, driver-reported disconnect, keepalive
    /// send failure.
    #[error("transient io error: {0}")]
    TransientIo(#[source] anyhow::Error),

    /// Per-message: isolates the offending message. Unmarshal failure,
    /// missing required mapping field.
    #[error("data error on message {id}: {source}")]
    Data {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reported via `LastWriteIdempotent`, not surfaced as an error to the
    /// engine; kept here so sinks can still return it through `Result` when
    /// convenient (e.g. from a helper function) before translating it.
    #[error("delivery conflict: dedup={dedup} conflict={conflict}")]
    DeliveryConflict { dedup: bool, conflict: bool },

    /// Propagates upward unchanged.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HermodError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HermodError::TransientIo(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, HermodError::Configuration(_))
    }

    pub fn data(id: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        HermodError::Data {
            id: id.into(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HermodError>;
