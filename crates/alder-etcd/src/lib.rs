//! etcd client plumbing for alder.
//!
//! Three pieces: the `etcd://` DSN parser, a thin client wrapper for the
//! range/put/delete operations the sync paths need, and a restartable
//! watch that survives channel closes and reports compaction instead of
//! silently losing events.

pub mod client;
pub mod dsn;
pub mod watch;

pub use client::EtcdSync;
pub use client::Snapshot;
pub use dsn::EtcdConfig;
pub use watch::RecoveringWatch;
pub use watch::WatchOutcome;
