//! Connection pool and the relational operations of the sync paths.

use std::str::FromStr;
use std::time::Duration;

use alder_core::KeyValueRecord;
use alder_core::RetryConfig;
use alder_core::retry_with_backoff;
use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgConnectOptions;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Pool connect timeout, matching the etcd dial default.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on pooled connections. The daemon runs three tasks; this
/// leaves headroom for application writers sharing the pool in tests.
const MAX_CONNECTIONS: u32 = 10;

/// Pipelined batch upsert. Arrays arrive positionally via UNNEST so one
/// statement covers the whole batch; the conflict target collapses
/// duplicate `(key, revision)` pairs, which makes re-running a batch (or
/// a whole initial sync) idempotent.
const UPSERT_BATCH: &str = r#"
INSERT INTO etcd (ts, key, value, revision, tombstone)
SELECT * FROM UNNEST($1::timestamptz[], $2::text[], $3::text[], $4::bigint[], $5::boolean[])
ON CONFLICT (key, revision) DO UPDATE
    SET ts = EXCLUDED.ts, value = EXCLUDED.value, tombstone = EXCLUDED.tombstone
"#;

/// Row shape shared by `kv_get`, `kv_get_all`, and `kv_get_pending`.
#[derive(sqlx::FromRow)]
struct KeyValueRow {
    key: String,
    value: Option<String>,
    revision: i64,
    tombstone: bool,
    ts: DateTime<Utc>,
}

impl From<KeyValueRow> for KeyValueRecord {
    fn from(row: KeyValueRow) -> Self {
        KeyValueRecord {
            key: row.key,
            value: row.value,
            revision: row.revision,
            ts: row.ts,
            tombstone: row.tombstone,
        }
    }
}

/// Shared PostgreSQL handle for the sync paths.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect once using a standard `postgres://` URL.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(dsn)
            .context("failed to parse PostgreSQL DSN")?
            .application_name("alder");
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(options)
            .await
            .context("failed to connect to PostgreSQL")?;

        info!("connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Connect with the database retry policy, pinging so a dead server
    /// behind a live proxy is not mistaken for healthy.
    pub async fn connect_with_retry(cancel: &CancellationToken, dsn: &str) -> Result<Self> {
        let store = retry_with_backoff(cancel, &RetryConfig::postgres(), "postgres connect", || async move {
            let store = Self::connect(dsn).await?;
            store.ping().await?;
            Ok::<_, anyhow::Error>(store)
        })
        .await?;
        Ok(store)
    }

    /// The underlying pool, for the schema installer.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("PostgreSQL ping failed")?;
        Ok(())
    }

    /// Upsert a batch of rows in one pipelined statement.
    ///
    /// Partial failure aborts the whole batch; callers re-run it, and the
    /// conflict target makes the re-run collapse into the same rows.
    pub async fn upsert_records(&self, records: &[KeyValueRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut timestamps = Vec::with_capacity(records.len());
        let mut keys = Vec::with_capacity(records.len());
        let mut values = Vec::with_capacity(records.len());
        let mut revisions = Vec::with_capacity(records.len());
        let mut tombstones = Vec::with_capacity(records.len());

        for record in records {
            record.validate()?;
            timestamps.push(record.ts);
            keys.push(record.key.clone());
            values.push(record.value.clone());
            revisions.push(record.revision);
            tombstones.push(record.tombstone);
        }

        sqlx::query(UPSERT_BATCH)
            .bind(&timestamps)
            .bind(&keys)
            .bind(&values)
            .bind(&revisions)
            .bind(&tombstones)
            .execute(&self.pool)
            .await
            .context("batch upsert failed")?;

        debug!(count = records.len(), "upserted records");
        Ok(())
    }

    /// All pending rows, ts ascending (FIFO across keys).
    pub async fn pending_records(&self) -> Result<Vec<KeyValueRecord>> {
        let rows: Vec<KeyValueRow> = sqlx::query_as("SELECT * FROM kv_get_pending()")
            .fetch_all(&self.pool)
            .await
            .context("failed to query pending records")?;
        Ok(rows.into_iter().map(KeyValueRecord::from).collect())
    }

    /// Flip a pending row to its confirmed etcd revision.
    ///
    /// Returns whether a row matched; `false` means the pending row was
    /// raced away, which callers treat as a no-op.
    pub async fn mark_applied(&self, key: &str, ts: DateTime<Utc>, revision: i64) -> Result<bool> {
        let matched: bool = sqlx::query_scalar("SELECT kv_update_revision($1, $2, $3)")
            .bind(key)
            .bind(ts)
            .bind(revision)
            .fetch_one(&self.pool)
            .await
            .context("failed to update pending revision")?;
        Ok(matched)
    }

    /// Highest confirmed revision in the table, 0 when empty. Pending
    /// rows are excluded.
    pub async fn latest_revision(&self) -> Result<i64> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT MAX(revision) FROM etcd WHERE revision > 0")
                .fetch_one(&self.pool)
                .await
                .context("failed to query latest revision")?;
        Ok(revision.unwrap_or(0))
    }

    /// Latest row for a key via `kv_get`; pending rows sort first
    /// (read-your-writes).
    pub async fn get(&self, key: &str) -> Result<Option<KeyValueRecord>> {
        let row: Option<KeyValueRow> = sqlx::query_as("SELECT * FROM kv_get($1)")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("kv_get failed for key '{key}'"))?;
        Ok(row.map(KeyValueRecord::from))
    }

    /// History replay for a key via `kv_get_all`: rows with revision
    /// above `min_rev`, ascending.
    pub async fn history(&self, key: &str, min_rev: i64) -> Result<Vec<KeyValueRecord>> {
        let rows: Vec<KeyValueRow> = sqlx::query_as("SELECT * FROM kv_get_all($1, $2)")
            .bind(key)
            .bind(min_rev)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("kv_get_all failed for key '{key}'"))?;
        Ok(rows.into_iter().map(KeyValueRecord::from).collect())
    }

    /// Application-facing pending put via `kv_put`; returns the row ts.
    pub async fn kv_put(&self, key: &str, value: &str) -> Result<DateTime<Utc>> {
        let ts: DateTime<Utc> = sqlx::query_scalar("SELECT kv_put($1, $2)")
            .bind(key)
            .bind(value)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("kv_put failed for key '{key}'"))?;
        Ok(ts)
    }

    /// Application-facing pending delete via `kv_delete`; returns the
    /// row ts.
    pub async fn kv_delete(&self, key: &str) -> Result<DateTime<Utc>> {
        let ts: DateTime<Utc> = sqlx::query_scalar("SELECT kv_delete($1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("kv_delete failed for key '{key}'"))?;
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_statement_shape() {
        assert!(UPSERT_BATCH.contains("INSERT INTO etcd (ts, key, value, revision, tombstone)"));
        assert!(UPSERT_BATCH.contains("UNNEST"));
        assert!(UPSERT_BATCH.contains("ON CONFLICT (key, revision) DO UPDATE"));
        // The upsert refreshes everything except the identity columns.
        for column in ["ts = EXCLUDED.ts", "value = EXCLUDED.value", "tombstone = EXCLUDED.tombstone"] {
            assert!(UPSERT_BATCH.contains(column));
        }
    }

    #[test]
    fn row_conversion_keeps_nullability() {
        let row = KeyValueRow {
            key: "/a".to_string(),
            value: None,
            revision: 11,
            tombstone: true,
            ts: Utc::now(),
        };
        let record = KeyValueRecord::from(row);
        assert_eq!(record.key, "/a");
        assert_eq!(record.value, None);
        assert!(record.tombstone);
        record.validate().unwrap();
    }

    #[test]
    fn invalid_records_never_reach_the_wire() {
        let mut record = KeyValueRecord::put("/a", "v", 5);
        record.revision = 0;
        // upsert_records validates before binding; the same check is
        // reachable synchronously here.
        assert!(record.validate().is_err());
    }
}
