//! Core types for bidirectional etcd ⇄ PostgreSQL synchronization.
//!
//! This crate holds the pieces every other alder crate depends on: the
//! [`KeyValueRecord`] row type with its revision-sentinel encoding, the
//! typed configuration and record errors, pure revision arithmetic, and
//! the cancellation-aware retry primitive.

pub mod error;
pub mod record;
pub mod retry;
pub mod revision;

pub use error::ConfigError;
pub use error::RecordError;
pub use record::KeyValueRecord;
pub use record::PENDING_REVISION;
pub use retry::RetryConfig;
pub use retry::RetryError;
pub use retry::retry_with_backoff;
pub use revision::baseline_revision;
pub use revision::next_watch_revision;
