//! Bidirectional synchronization daemon between etcd and PostgreSQL.
//!
//! The daemon mirrors a key prefix in both directions: an initial bulk
//! backfill and a revision-ordered watch carry etcd state into the
//! `etcd` table (forward path), while a periodic poll of pending rows
//! carries locally-authored writes back to etcd (reverse path). etcd
//! always wins on conflict; the forward path re-materializes its view.

#![warn(missing_docs)]

/// Daemon orchestration: initial sync plus the two sync tasks.
pub mod daemon;

pub use daemon::Service;
pub use daemon::ServiceConfig;
