//! Thin wrapper over the etcd client for the two sync paths.
//!
//! The wrapper owns connection construction from an [`EtcdConfig`],
//! exposes exactly the operations the daemon needs (sorted prefix range
//! read, put, delete, watch subscription), and converts responses into
//! [`KeyValueRecord`]s so the rest of the system never touches protobuf
//! types.

use alder_core::KeyValueRecord;
use alder_core::RetryConfig;
use alder_core::baseline_revision;
use alder_core::next_watch_revision;
use alder_core::retry_with_backoff;
use anyhow::Context;
use anyhow::Result;
use etcd_client::Client;
use etcd_client::ConnectOptions;
use etcd_client::GetOptions;
use etcd_client::SortOrder;
use etcd_client::SortTarget;
use etcd_client::TlsOptions;
use etcd_client::WatchOptions;
use etcd_client::WatchStream;
use etcd_client::Watcher;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::dsn::EtcdConfig;

/// Result of a full prefix range read.
#[derive(Debug)]
pub struct Snapshot {
    /// One record per live key, ascending key order.
    pub records: Vec<KeyValueRecord>,
    /// Highest revision the response reflects; resume point for a watch.
    pub baseline: i64,
}

/// Shared etcd handle for the sync paths.
///
/// The underlying client is concurrency-safe; cloning is cheap and each
/// operation clones internally because the client API takes `&mut self`.
#[derive(Clone)]
pub struct EtcdSync {
    client: Client,
    prefix: String,
}

impl EtcdSync {
    /// Connect once using the parsed DSN configuration.
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }
        if let Some(request_timeout) = config.request_timeout {
            options = options.with_timeout(request_timeout);
        }
        if config.tls {
            options = options.with_tls(TlsOptions::new());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .context("failed to connect to etcd")?;

        info!(endpoints = ?config.endpoints, prefix = %config.prefix, "connected to etcd");

        Ok(Self {
            client,
            prefix: config.prefix.clone(),
        })
    }

    /// Connect with the etcd retry policy, probing the connection with a
    /// read so a half-up endpoint is not mistaken for a healthy one.
    pub async fn connect_with_retry(cancel: &CancellationToken, config: &EtcdConfig) -> Result<Self> {
        let sync = retry_with_backoff(cancel, &RetryConfig::etcd(), "etcd connect", || async move {
            let sync = Self::connect(config).await?;
            sync.probe().await?;
            Ok::<_, anyhow::Error>(sync)
        })
        .await?;
        Ok(sync)
    }

    /// Cheap liveness probe: a single-key read under the prefix.
    pub async fn probe(&self) -> Result<()> {
        let mut client = self.client.clone();
        client
            .get(self.prefix.as_str(), Some(GetOptions::new().with_limit(1)))
            .await
            .context("etcd probe read failed")?;
        Ok(())
    }

    /// Range-read every key under the prefix in ascending order.
    ///
    /// The baseline is the maximum of the response header revision and
    /// the largest key ModRevision, so pure deletes still advance it.
    pub async fn fetch_all(&self) -> Result<Snapshot> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let response = client
            .get(self.prefix.as_str(), Some(options))
            .await
            .context("failed to range-read prefix")?;

        let header_revision = response.header().map(|h| h.revision()).unwrap_or(0);
        let mut max_mod_revision = 0;
        let mut records = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = String::from_utf8_lossy(kv.key()).into_owned();
            let value = String::from_utf8_lossy(kv.value()).into_owned();
            max_mod_revision = max_mod_revision.max(kv.mod_revision());
            records.push(KeyValueRecord::put(key, value, kv.mod_revision()));
        }

        let baseline = baseline_revision(header_revision, max_mod_revision);
        info!(
            prefix = %self.prefix,
            count = records.len(),
            baseline,
            "range-read prefix from etcd"
        );

        Ok(Snapshot { records, baseline })
    }

    /// Put a key, returning the revision etcd assigned.
    pub async fn put(&self, key: &str, value: &str) -> Result<i64> {
        let mut client = self.client.clone();
        let response = client
            .put(key, value, None)
            .await
            .with_context(|| format!("failed to put key '{key}'"))?;
        let revision = response
            .header()
            .map(|h| h.revision())
            .context("put response carried no header revision")?;
        debug!(key = %key, revision, "put key to etcd");
        Ok(revision)
    }

    /// Delete a key, returning the revision etcd assigned.
    pub async fn delete(&self, key: &str) -> Result<i64> {
        let mut client = self.client.clone();
        let response = client
            .delete(key, None)
            .await
            .with_context(|| format!("failed to delete key '{key}'"))?;
        let revision = response
            .header()
            .map(|h| h.revision())
            .context("delete response carried no header revision")?;
        debug!(key = %key, revision, deleted = response.deleted(), "deleted key from etcd");
        Ok(revision)
    }

    /// Subscribe to all events under the prefix, resuming after `cursor`.
    pub(crate) async fn watch_prefix(&self, cursor: i64) -> Result<(Watcher, WatchStream)> {
        let mut client = self.client.clone();
        let start_revision = next_watch_revision(cursor);
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (watcher, stream) = client
            .watch(self.prefix.as_str(), Some(options))
            .await
            .context("failed to establish etcd watch")?;
        info!(prefix = %self.prefix, start_revision, "started etcd watch");
        Ok((watcher, stream))
    }
}
