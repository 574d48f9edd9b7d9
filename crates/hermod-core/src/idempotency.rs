//! The idempotency store contract (spec.md §3, §4.9).
//!
//! The concrete SQLite-backed implementation lives in the `hermod-idempotency`
//! crate; this crate only defines the record shape and the trait so that
//! sinks (notably the SMTP sink) can depend on the contract without pulling
//! in a SQL driver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum IdempotencyStatus {
    Claimed = 0,
    Sent = 1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub first_seen_at: chrono::DateTime<chrono::Utc>,
    pub last_update: chrono::DateTime<chrono::Utc>,
}

/// `Claim`/`MarkSent` over a transactional KV store (spec.md §4.9).
///
/// At-most-one caller observes `claim(key) == true` per key; a sink should
/// only perform its side effect when it does, and call `mark_sent` once
/// that side effect has durably happened.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Attempt to claim `key`. Returns `true` iff this call actually
    /// inserted the row (i.e. the caller is the first to see this key).
    async fn claim(&self, key: &str) -> anyhow::Result<bool>;

    /// Mark a previously-claimed key as sent.
    async fn mark_sent(&self, key: &str) -> anyhow::Result<()>;

    /// Look up a key's current record, if any.
    async fn get(&self, key: &str) -> anyhow::Result<Option<IdempotencyRecord>>;
}
