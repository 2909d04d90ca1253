//! PostgreSQL side of the alder sync daemon.
//!
//! One table, two indexes, six SQL routines. The daemon and application
//! writers share the same installed contract: applications call `kv_put`
//! / `kv_delete` / `kv_get`, the daemon drains `kv_get_pending` and
//! stamps confirmed revisions with `kv_update_revision`.

pub mod schema;
pub mod store;

pub use schema::SchemaInstaller;
pub use store::PgStore;
