//! Idempotent schema installation.
//!
//! Installs the `etcd` table, its two indexes, and the six `kv_*`
//! routines. Everything is `IF NOT EXISTS` / `OR REPLACE`, so re-running
//! against an installed schema is a no-op. Version bookkeeping is the
//! collaborating migration tooling's concern; this installer only brings
//! an empty database up to the current contract.

use anyhow::Context;
use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

/// The `etcd` table: full revision history per key, plus at most one
/// pending (`revision = -1`) row per key enforced by the primary key.
const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS etcd (
    ts timestamp with time zone NOT NULL DEFAULT now(),
    key text NOT NULL,
    value text,
    revision bigint NOT NULL,
    tombstone boolean NOT NULL DEFAULT false,
    PRIMARY KEY (key, revision)
);
"#;

/// Time-range queries over history.
const CREATE_TS_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_etcd_ts ON etcd (ts);";

/// Partial index so the pending scan is O(pending), independent of
/// history depth.
const CREATE_PENDING_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_etcd_pending ON etcd (key) WHERE revision = -1;";

/// Latest row for a key. A pending row is the reader's own unconfirmed
/// write and sorts first (read-your-writes); otherwise the highest
/// positive revision wins.
const CREATE_KV_GET: &str = r#"
CREATE OR REPLACE FUNCTION kv_get(k text)
RETURNS TABLE (key text, value text, revision bigint, tombstone boolean, ts timestamptz)
LANGUAGE sql STABLE AS $$
    SELECT e.key, e.value, e.revision, e.tombstone, e.ts
    FROM etcd e
    WHERE e.key = k
    ORDER BY (e.revision = -1) DESC, e.revision DESC
    LIMIT 1
$$;
"#;

/// History replay for a key: every row above `min_rev`, ascending.
const CREATE_KV_GET_ALL: &str = r#"
CREATE OR REPLACE FUNCTION kv_get_all(k text, min_rev bigint)
RETURNS TABLE (key text, value text, revision bigint, tombstone boolean, ts timestamptz)
LANGUAGE sql STABLE AS $$
    SELECT e.key, e.value, e.revision, e.tombstone, e.ts
    FROM etcd e
    WHERE e.key = k AND e.revision > min_rev
    ORDER BY e.revision ASC
$$;
"#;

/// Application write: insert a pending row, or fold into the existing
/// pending row for the key (the primary key admits only one).
const CREATE_KV_PUT: &str = r#"
CREATE OR REPLACE FUNCTION kv_put(k text, v text)
RETURNS timestamptz
LANGUAGE sql AS $$
    INSERT INTO etcd (key, value, revision, tombstone)
    VALUES (k, v, -1, false)
    ON CONFLICT (key, revision) DO UPDATE
        SET value = EXCLUDED.value, ts = now(), tombstone = false
    RETURNING ts
$$;
"#;

/// Application delete: a pending tombstone, merged the same way.
const CREATE_KV_DELETE: &str = r#"
CREATE OR REPLACE FUNCTION kv_delete(k text)
RETURNS timestamptz
LANGUAGE sql AS $$
    INSERT INTO etcd (key, value, revision, tombstone)
    VALUES (k, NULL, -1, true)
    ON CONFLICT (key, revision) DO UPDATE
        SET value = NULL, ts = now(), tombstone = true
    RETURNING ts
$$;
"#;

/// FIFO view of locally-authored writes awaiting the reverse path.
const CREATE_KV_GET_PENDING: &str = r#"
CREATE OR REPLACE FUNCTION kv_get_pending()
RETURNS TABLE (key text, value text, revision bigint, tombstone boolean, ts timestamptz)
LANGUAGE sql STABLE AS $$
    SELECT e.key, e.value, e.revision, e.tombstone, e.ts
    FROM etcd e
    WHERE e.revision = -1
    ORDER BY e.ts ASC
$$;
"#;

/// Flip exactly the pending row `{k, ts_of_row, -1}` to its confirmed
/// etcd revision. Returns whether any row matched. If the forward path
/// already materialized `(k, new_rev)` from the watch, the pending row
/// is redundant and is dropped instead.
const CREATE_KV_UPDATE_REVISION: &str = r#"
CREATE OR REPLACE FUNCTION kv_update_revision(k text, ts_of_row timestamptz, new_rev bigint)
RETURNS boolean
LANGUAGE plpgsql AS $$
DECLARE
    updated integer;
BEGIN
    UPDATE etcd SET revision = new_rev
    WHERE key = k AND ts = ts_of_row AND revision = -1;
    GET DIAGNOSTICS updated = ROW_COUNT;
    RETURN updated > 0;
EXCEPTION WHEN unique_violation THEN
    DELETE FROM etcd WHERE key = k AND ts = ts_of_row AND revision = -1;
    RETURN true;
END;
$$;
"#;

/// All statements, install order.
const STATEMENTS: [&str; 9] = [
    CREATE_TABLE,
    CREATE_TS_INDEX,
    CREATE_PENDING_INDEX,
    CREATE_KV_GET,
    CREATE_KV_GET_ALL,
    CREATE_KV_PUT,
    CREATE_KV_DELETE,
    CREATE_KV_GET_PENDING,
    CREATE_KV_UPDATE_REVISION,
];

/// Explicit installer object, constructed once and handed to the daemon.
pub struct SchemaInstaller {
    pool: PgPool,
}

impl SchemaInstaller {
    /// Bind the installer to a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Install the table, indexes, and routines. Idempotent.
    pub async fn install(&self) -> Result<()> {
        for statement in STATEMENTS {
            sqlx::raw_sql(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", first_line(statement)))?;
        }
        info!(statements = STATEMENTS.len(), "schema installed");
        Ok(())
    }
}

fn first_line(statement: &str) -> &str {
    statement.trim_start().lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_contract() {
        assert!(CREATE_TABLE.contains("CREATE TABLE IF NOT EXISTS etcd"));
        assert!(CREATE_TABLE.contains("ts timestamp with time zone NOT NULL DEFAULT now()"));
        assert!(CREATE_TABLE.contains("revision bigint NOT NULL"));
        assert!(CREATE_TABLE.contains("tombstone boolean NOT NULL DEFAULT false"));
        assert!(CREATE_TABLE.contains("PRIMARY KEY (key, revision)"));
    }

    #[test]
    fn pending_index_is_partial() {
        assert!(CREATE_PENDING_INDEX.contains("WHERE revision = -1"));
    }

    #[test]
    fn every_statement_is_idempotent() {
        for statement in STATEMENTS {
            let idempotent =
                statement.contains("IF NOT EXISTS") || statement.contains("CREATE OR REPLACE");
            assert!(idempotent, "not idempotent: {}", first_line(statement));
        }
    }

    #[test]
    fn kv_get_prefers_pending_then_highest_revision() {
        assert!(CREATE_KV_GET.contains("ORDER BY (e.revision = -1) DESC, e.revision DESC"));
        assert!(CREATE_KV_GET.contains("LIMIT 1"));
    }

    #[test]
    fn pending_view_is_fifo() {
        assert!(CREATE_KV_GET_PENDING.contains("WHERE e.revision = -1"));
        assert!(CREATE_KV_GET_PENDING.contains("ORDER BY e.ts ASC"));
    }

    #[test]
    fn writes_merge_on_primary_key_collision() {
        for statement in [CREATE_KV_PUT, CREATE_KV_DELETE] {
            assert!(statement.contains("ON CONFLICT (key, revision) DO UPDATE"));
        }
        assert!(CREATE_KV_DELETE.contains("tombstone = true"));
    }
}
