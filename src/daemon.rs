//! Daemon orchestration: initial sync, forward path, reverse path.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!        watch       │ forward task │   batch upsert
//!   etcd ──────────▶ │ (revision-   │ ──────────────▶ etcd table
//!    ▲               │  ordered)    │
//!    │               └──────────────┘
//!    │ put/delete    ┌──────────────┐
//!    └────────────── │ reverse task │ ◀── kv_get_pending() poll
//!                    │ (ts-ordered) │ ──▶ kv_update_revision()
//!                    └──────────────┘
//! ```
//!
//! Both tasks share one PostgreSQL pool and one etcd client and hang off
//! a single root cancellation token. Row-level conflicts between them are
//! impossible: the primary key segregates revisions, and only the reverse
//! path mutates pending rows, through an atomic SQL routine.

use std::time::Duration;

use alder_core::KeyValueRecord;
use alder_core::RetryConfig;
use alder_core::RetryError;
use alder_core::retry_with_backoff;
use alder_db::PgStore;
use alder_db::SchemaInstaller;
use alder_etcd::EtcdSync;
use alder_etcd::RecoveringWatch;
use alder_etcd::WatchOutcome;
use anyhow::Context;
use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Tunables for the daemon.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Reverse-path poll interval.
    pub polling_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
        }
    }
}

/// The composed sync daemon.
pub struct Service {
    store: PgStore,
    etcd: EtcdSync,
    config: ServiceConfig,
}

impl Service {
    /// Compose the daemon from its two endpoint handles.
    pub fn new(store: PgStore, etcd: EtcdSync, config: ServiceConfig) -> Self {
        Self { store, etcd, config }
    }

    /// Run until cancellation or an unrecoverable task failure.
    ///
    /// Installs the schema, performs the initial sync, then runs the
    /// forward and reverse tasks concurrently. Returns `Ok(())` on clean
    /// shutdown.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        SchemaInstaller::new(self.store.pool().clone())
            .install()
            .await
            .context("schema installation failed")?;

        let mut baseline = match initial_sync(&self.store, &self.etcd, &cancel).await {
            Ok(baseline) => baseline,
            Err(err) if err.is_cancelled() => return Ok(()),
            Err(err) => return Err(err).context("initial sync failed"),
        };

        // A restarted daemon may already hold history beyond this range
        // read (events forwarded just before the previous shutdown).
        let stored = self.store.latest_revision().await?;
        if stored > baseline {
            debug!(stored, baseline, "stored history is ahead of range read");
            baseline = stored;
        }

        info!(baseline, "starting synchronization");

        let forward_cancel = cancel.child_token();
        let mut forward = tokio::spawn(forward_task(
            self.store.clone(),
            self.etcd.clone(),
            baseline,
            forward_cancel.clone(),
        ));

        let reverse_cancel = cancel.child_token();
        let mut reverse = tokio::spawn(reverse_task(
            self.store.clone(),
            self.etcd.clone(),
            self.config.polling_interval,
            reverse_cancel.clone(),
        ));

        // First failure wins; a cancelled root token reaches both tasks
        // through their child tokens. Either way both tasks are drained
        // before returning, so shutdown is bounded by one in-flight op
        // plus one backoff interval.
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                let (forward_result, reverse_result) = tokio::join!(&mut forward, &mut reverse);
                flatten_task("forward", forward_result).and(flatten_task("reverse", reverse_result))
            }
            joined = &mut forward => {
                reverse_cancel.cancel();
                let reverse_result = (&mut reverse).await;
                flatten_task("forward", joined).and(flatten_task("reverse", reverse_result))
            }
            joined = &mut reverse => {
                forward_cancel.cancel();
                let forward_result = (&mut forward).await;
                flatten_task("reverse", joined).and(flatten_task("forward", forward_result))
            }
        };

        info!("synchronization stopped");
        result
    }
}

fn flatten_task(name: &str, joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.with_context(|| format!("{name} path failed")),
        Err(err) => Err(anyhow::anyhow!("{name} task panicked: {err}")),
    }
}

/// Range-read the whole prefix and upsert it as one retried unit.
///
/// Safe to repeat: the upsert collapses duplicates on `(key, revision)`.
/// Returns the baseline revision for the watch.
async fn initial_sync(
    store: &PgStore,
    etcd: &EtcdSync,
    cancel: &CancellationToken,
) -> Result<i64, RetryError> {
    let baseline = retry_with_backoff(cancel, &RetryConfig::etcd(), "initial sync", || async move {
        let snapshot = etcd.fetch_all().await?;
        store.upsert_records(&snapshot.records).await?;
        Ok::<_, anyhow::Error>(snapshot.baseline)
    })
    .await?;

    info!(baseline, "initial sync completed");
    Ok(baseline)
}

/// Forward path: etcd events into the table, in strict revision order.
async fn forward_task(
    store: PgStore,
    etcd: EtcdSync,
    baseline: i64,
    cancel: CancellationToken,
) -> Result<()> {
    let mut watch = RecoveringWatch::new(etcd.clone(), baseline);

    loop {
        match watch.recv(&cancel).await {
            WatchOutcome::Batch(records) => {
                if let Err(err) = forward_batch(&store, &mut watch, records, &cancel).await {
                    if err.is_cancelled() {
                        info!("forward path cancelled");
                        return Ok(());
                    }
                    // The cursor still points at the last durably
                    // forwarded event; resubscribing replays the rest.
                    warn!(error = %err, cursor = watch.cursor(), "forwarding stalled, re-establishing watch");
                    let cursor = watch.cursor();
                    watch.reset(cursor);
                }
            }
            WatchOutcome::Desynchronized { compact_revision } => {
                warn!(
                    compact_revision,
                    cursor = watch.cursor(),
                    "watch history compacted, running fresh initial sync"
                );
                match initial_sync(&store, &etcd, &cancel).await {
                    Ok(baseline) => watch.reset(baseline),
                    Err(err) if err.is_cancelled() => {
                        info!("forward path cancelled");
                        return Ok(());
                    }
                    Err(err) => return Err(err).context("recovery initial sync failed"),
                }
            }
            WatchOutcome::Cancelled => {
                info!("forward path cancelled");
                return Ok(());
            }
        }
    }
}

/// Insert one watch batch, advancing the cursor per forwarded event.
///
/// Stops at the first event whose insert exhausts its retries, leaving
/// the cursor on the last success so the caller can replay from there.
async fn forward_batch(
    store: &PgStore,
    watch: &mut RecoveringWatch,
    records: Vec<KeyValueRecord>,
    cancel: &CancellationToken,
) -> Result<(), RetryError> {
    for record in records {
        let revision = record.revision;
        retry_with_backoff(cancel, &RetryConfig::postgres(), "forward insert", || {
            let record = record.clone();
            let store = store.clone();
            async move { store.upsert_records(std::slice::from_ref(&record)).await }
        })
        .await?;

        debug!(key = %record.key, revision, tombstone = record.tombstone, "forwarded event");
        watch.advance(revision);
    }
    Ok(())
}

/// Reverse path: poll pending rows and apply them to etcd, FIFO by ts.
async fn reverse_task(
    store: PgStore,
    etcd: EtcdSync,
    polling_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = interval(polling_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_ms = polling_interval.as_millis() as u64, "reverse path started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reverse path cancelled");
                return Ok(());
            }
            _ = ticker.tick() => {
                apply_pending(&store, &etcd, &cancel).await;
            }
        }
    }
}

/// Drain the current pending set. Failures leave rows pending for the
/// next poll; only cancellation stops the cycle early.
async fn apply_pending(store: &PgStore, etcd: &EtcdSync, cancel: &CancellationToken) {
    let pending = match store.pending_records().await {
        Ok(pending) => pending,
        Err(err) => {
            warn!(error = %err, "failed to read pending records");
            return;
        }
    };

    for record in pending {
        // Etcd-wins: no read-compare, the pending value always overwrites.
        // If something newer landed in etcd meanwhile, the forward path
        // re-materializes it at a higher revision.
        let applied = retry_with_backoff(cancel, &RetryConfig::etcd(), "apply pending", || {
            let etcd = etcd.clone();
            let record = record.clone();
            async move {
                if record.tombstone {
                    etcd.delete(&record.key).await
                } else {
                    etcd.put(&record.key, record.value_or_empty()).await
                }
            }
        })
        .await;

        match applied {
            Ok(revision) => match store.mark_applied(&record.key, record.ts, revision).await {
                Ok(true) => {
                    info!(key = %record.key, revision, tombstone = record.tombstone, "applied pending record");
                }
                Ok(false) => {
                    // Someone raced the pending row away; nothing to stamp.
                    debug!(key = %record.key, revision, "pending record already gone");
                }
                Err(err) => {
                    warn!(key = %record.key, error = %err, "failed to stamp applied revision");
                }
            },
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                // Row stays at -1 and is re-picked on the next poll.
                warn!(key = %record.key, error = %err, "pending record not applied");
            }
        }
    }
}
