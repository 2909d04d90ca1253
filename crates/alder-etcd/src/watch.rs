//! Restartable watch over an etcd prefix.
//!
//! Presents the forward path with a plain "next batch of events" surface
//! while internally tearing down and re-subscribing whenever the stream
//! closes, is canceled by the server, or surfaces an error. The resume
//! cursor advances only when the caller says an event was durably
//! forwarded, so a fault inside forwarding replays from the last
//! known-good revision rather than the last received one.
//!
//! Compaction of the resume revision cannot be healed by resubscribing;
//! it is surfaced as [`WatchOutcome::Desynchronized`] so the daemon can
//! escalate to a fresh initial sync.

use std::time::Duration;

use alder_core::KeyValueRecord;
use etcd_client::EventType;
use etcd_client::WatchResponse;
use etcd_client::WatchStream;
use etcd_client::Watcher;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::client::EtcdSync;

/// Fixed delay between watch re-establishment attempts, to avoid tight
/// spin against a failing server.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// What the watch produced.
#[derive(Debug)]
pub enum WatchOutcome {
    /// Events in strict revision order, already converted to rows.
    Batch(Vec<KeyValueRecord>),
    /// The resume revision has been compacted away; a resubscribe cannot
    /// recover the gap.
    Desynchronized {
        /// The server's oldest retained revision.
        compact_revision: i64,
    },
    /// The daemon is shutting down.
    Cancelled,
}

/// Watch subscription with automatic re-establishment.
pub struct RecoveringWatch {
    client: EtcdSync,
    cursor: i64,
    stream: Option<(Watcher, WatchStream)>,
}

impl RecoveringWatch {
    /// Create a watch that resumes just after `baseline`.
    pub fn new(client: EtcdSync, baseline: i64) -> Self {
        Self {
            client,
            cursor: baseline,
            stream: None,
        }
    }

    /// Largest revision the caller has confirmed as forwarded.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Record that the event at `revision` was durably forwarded.
    pub fn advance(&mut self, revision: i64) {
        self.cursor = self.cursor.max(revision);
    }

    /// Restart from a new baseline, dropping any live subscription.
    /// Used after a fresh initial sync repaired a compaction gap.
    pub fn reset(&mut self, baseline: i64) {
        self.cursor = baseline;
        self.stream = None;
    }

    /// Wait for the next non-empty batch of events.
    ///
    /// Re-subscribes as needed; only compaction and cancellation are
    /// surfaced to the caller.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> WatchOutcome {
        loop {
            if cancel.is_cancelled() {
                return WatchOutcome::Cancelled;
            }

            if self.stream.is_none() {
                match self.client.watch_prefix(self.cursor).await {
                    Ok(pair) => self.stream = Some(pair),
                    Err(err) => {
                        warn!(error = %err, cursor = self.cursor, "failed to establish watch, retrying");
                        if Self::pause(cancel).await {
                            return WatchOutcome::Cancelled;
                        }
                        continue;
                    }
                }
            }

            let Some((_, stream)) = self.stream.as_mut() else {
                continue;
            };

            let message = tokio::select! {
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                message = stream.message() => message,
            };

            match message {
                Ok(Some(response)) => {
                    if response.compact_revision() > 0 {
                        warn!(
                            cursor = self.cursor,
                            compact_revision = response.compact_revision(),
                            "watch revision compacted away, desynchronized"
                        );
                        self.stream = None;
                        return WatchOutcome::Desynchronized {
                            compact_revision: response.compact_revision(),
                        };
                    }

                    if response.canceled() {
                        warn!(
                            reason = response.cancel_reason(),
                            cursor = self.cursor,
                            "watch canceled by server, resubscribing"
                        );
                        self.stream = None;
                        if Self::pause(cancel).await {
                            return WatchOutcome::Cancelled;
                        }
                        continue;
                    }

                    let records = convert_events(&response);
                    if records.is_empty() {
                        // Progress notification; nothing to forward.
                        continue;
                    }
                    return WatchOutcome::Batch(records);
                }
                Ok(None) => {
                    info!(cursor = self.cursor, "watch stream closed, resubscribing");
                    self.stream = None;
                    if Self::pause(cancel).await {
                        return WatchOutcome::Cancelled;
                    }
                }
                Err(err) => {
                    warn!(error = %err, cursor = self.cursor, "watch stream error, resubscribing");
                    self.stream = None;
                    if Self::pause(cancel).await {
                        return WatchOutcome::Cancelled;
                    }
                }
            }
        }
    }

    /// Sleep the resubscribe delay; returns true when cancelled.
    async fn pause(cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => false,
        }
    }
}

/// Convert a watch response into rows, preserving event order.
fn convert_events(response: &WatchResponse) -> Vec<KeyValueRecord> {
    let mut records = Vec::with_capacity(response.events().len());
    for event in response.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let key = String::from_utf8_lossy(kv.key()).into_owned();
        match event.event_type() {
            EventType::Put => {
                let value = String::from_utf8_lossy(kv.value()).into_owned();
                records.push(KeyValueRecord::put(key, value, kv.mod_revision()));
            }
            EventType::Delete => {
                records.push(KeyValueRecord::tombstone(key, kv.mod_revision()));
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_is_interruptible() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // A cancelled token must short-circuit the fixed delay.
        let start = std::time::Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => panic!("sleep should lose to cancellation"),
        }
        assert!(start.elapsed() < RESUBSCRIBE_DELAY);
    }
}
