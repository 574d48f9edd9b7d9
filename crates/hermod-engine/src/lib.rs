//! The engine (spec.md §4.10): the coordinator that pumps messages from a
//! single configured [`hermod_core::Source`] to its configured
//! [`hermod_core::Sink`]s, with batching, retry/backoff, readiness polling
//! and Prometheus metrics.

pub mod backoff;
pub mod engine;
pub mod metrics;
pub mod ring;

pub use engine::Engine;
