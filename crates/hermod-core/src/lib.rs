//! # Hermod Core
//!
//! Foundational types and traits shared by every Hermod component: the
//! canonical [`Message`] envelope and its pool, the [`Source`]/[`Sink`]
//! contract the rest of the system is built against, pipeline configuration,
//! the small path evaluator used for dynamic field access, and the
//! dialect-aware SQL identifier quoter.
//!
//! Downstream crates (`hermod-sources`, `hermod-sinks`, `hermod-idempotency`,
//! `hermod-engine`) depend on this crate and on nothing else in the
//! workspace, so the contract defined here is the single seam the rest of
//! the system is built against.

pub mod column;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod idempotency;
pub mod message;
pub mod pool;
pub mod sink;
pub mod source;
pub mod sql_ident;

pub use column::{ColumnInfo, ColumnMapping};
pub use error::HermodError;
pub use idempotency::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
pub use message::{Message, Operation};
pub use pool::MessagePool;
pub use sink::{DeliveryOutcome, Sink};
pub use source::Source;
pub use sql_ident::SqlDialect;
