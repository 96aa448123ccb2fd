//! Connection Pool
//!
//! Time-boxed registry handing out opaque connection ids for open readers
//! and pending writes.
//!
//! ```text
//!   open_connection(v) ──► id ──► connection(id)   (refreshes activity)
//!                                      │
//!   disposal task ── every interval ──► evict idle or self-closed entries
//!                                      └─► value.close()
//! ```
//!
//! Eviction checks and activity refreshes both run under the owning
//! shard's write lock: a lookup that lands before the check keeps the
//! entry alive, and an evicted entry is closed exactly once.

mod shard;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics;

pub use shard::ShardedMap;

/// Values the pool can reclaim
#[async_trait]
pub trait Closable: Send + Sync {
    /// Whether the value closed itself (or was closed elsewhere)
    fn is_closed(&self) -> bool;

    /// Release the value's resources. Closing twice reports `Closed`.
    async fn close(&self) -> Result<()>;

    /// Drop caches an idle value can rebuild on its next use
    fn trim(&self) {}
}

/// Disposal sweep configuration
#[derive(Debug, Clone)]
pub struct DisposalConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Idle time after which an entry is evicted
    pub keep_alive: Duration,
}

impl Default for DisposalConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20 * 60),
            keep_alive: Duration::from_secs(10 * 60),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Default)]
pub struct DisposalReport {
    /// Connections removed
    pub evicted: Vec<Uuid>,
    /// Close failures, one per affected entry
    pub failures: Vec<Error>,
    /// Kept entries idle for over half the keep-alive, asked to trim
    pub trimmed: usize,
}

struct Entry<V> {
    activity: Instant,
    value: Arc<V>,
}

/// Registry of live connections for one kind of value
pub struct Connector<V> {
    name: &'static str,
    entries: ShardedMap<Uuid, Entry<V>>,
}

impl<V> std::fmt::Debug for Connector<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("connections", &self.entries.len())
            .finish()
    }
}

impl<V: Closable + 'static> Connector<V> {
    /// Create an empty pool; `name` labels its metrics and logs
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: ShardedMap::new(),
        }
    }

    /// Register `value` under a fresh id
    pub fn open_connection(&self, value: V) -> Uuid {
        self.open_shared(Arc::new(value))
    }

    pub fn open_shared(&self, value: Arc<V>) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            Entry {
                activity: Instant::now(),
                value,
            },
        );
        self.publish_len();
        debug!(pool = self.name, connection = %id, "Connection opened");
        id
    }

    /// Look a connection up and refresh its activity time
    pub fn connection(&self, id: Uuid) -> Result<Arc<V>> {
        self.entries
            .update(&id, |entry| {
                entry.activity = Instant::now();
                Arc::clone(&entry.value)
            })
            .ok_or_else(|| Error::NotFound(format!("connection {}", id)))
    }

    /// Unregister without closing
    pub fn remove(&self, id: Uuid) -> Option<Arc<V>> {
        let removed = self.entries.remove(&id).map(|entry| entry.value);
        self.publish_len();
        removed
    }

    /// Unregister and close. A value that already closed itself is not an error.
    pub async fn close_connection(&self, id: Uuid) -> Result<()> {
        let value = self
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", id)))?;
        close_quietly(value.as_ref()).await
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.keys()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Evict every entry idle longer than `keep_alive` or already closed,
    /// and trim survivors idle for more than half of it.
    ///
    /// Close failures are collected in the report; the sweep always runs
    /// to completion.
    #[instrument(skip(self), fields(pool = self.name))]
    pub async fn dispose(&self, keep_alive: Duration) -> DisposalReport {
        let now = Instant::now();
        let expired = self.entries.drain_where(|_, entry| {
            entry.value.is_closed() || now.saturating_duration_since(entry.activity) > keep_alive
        });
        self.publish_len();

        let mut report = DisposalReport::default();
        for (id, entry) in expired {
            if let Err(e) = close_quietly(entry.value.as_ref()).await {
                warn!(connection = %id, error = %e, "Failed to close evicted connection");
                report.failures.push(e);
            }
            report.evicted.push(id);
        }

        let idle_after = keep_alive / 2;
        let idle: Vec<Arc<V>> = self
            .entries
            .keys()
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .get_with(&id, |entry| {
                        (now.saturating_duration_since(entry.activity) > idle_after)
                            .then(|| Arc::clone(&entry.value))
                    })
                    .flatten()
            })
            .collect();
        for value in &idle {
            value.trim();
        }
        report.trimmed = idle.len();

        if !report.evicted.is_empty() {
            metrics::EVICTED_CONNECTIONS
                .with_label_values(&[self.name])
                .inc_by(report.evicted.len() as u64);
            debug!(evicted = report.evicted.len(), "Disposal sweep finished");
        }
        report
    }

    /// Start the background sweep. It stops when the returned task is
    /// stopped or dropped, or when the pool itself is dropped.
    pub fn start_disposal(self: &Arc<Self>, config: DisposalConfig) -> DisposalTask {
        let token = CancellationToken::new();
        let handle = tokio::spawn(disposal_loop(
            Arc::downgrade(self),
            config,
            token.clone(),
        ));
        DisposalTask {
            token,
            handle: Some(handle),
        }
    }

    fn publish_len(&self) {
        metrics::OPEN_CONNECTIONS
            .with_label_values(&[self.name])
            .set(self.entries.len() as i64);
    }
}

async fn close_quietly<V: Closable + ?Sized>(value: &V) -> Result<()> {
    match value.close().await {
        Err(Error::Closed(_)) => Ok(()),
        other => other,
    }
}

async fn disposal_loop<V: Closable + 'static>(
    pool: Weak<Connector<V>>,
    config: DisposalConfig,
    token: CancellationToken,
) {
    let mut tick = interval(config.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    tick.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let report = pool.dispose(config.keep_alive).await;
                if let Some(err) = Error::aggregate(report.failures) {
                    warn!(pool = pool.name(), error = %err, "Disposal sweep finished with errors");
                }
            }
        }
    }

    info!("Disposal task stopped");
}

/// Owned background sweep of one [`Connector`]
#[derive(Debug)]
pub struct DisposalTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DisposalTask {
    /// Stop the sweep and wait for an in-flight pass to finish
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Disposal task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for DisposalTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
