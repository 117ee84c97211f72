//! Per-client bucket registry with idle eviction.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::bucket::TokenBucket;
use super::clock::Clock;
use super::rules::PolicyConfig;
use crate::error::{Result, TrackgateError};

/// A bucket plus the last time anyone looked it up.
#[derive(Debug)]
struct RegistryEntry {
    bucket: Arc<TokenBucket>,
    last_access: Instant,
}

/// State shared between request handlers and the sweeper task.
struct RegistryInner {
    entries: DashMap<String, RegistryEntry>,
    capacity: u32,
    refill_rate: f64,
    cleanup_interval: Duration,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

/// Handle to a running sweeper task.
struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A concurrent map from client identity to token bucket.
///
/// Buckets are created lazily, full, on the first lookup of a key. A
/// background sweeper (see [`LimiterRegistry::start_sweeper`]) drops
/// entries nobody has touched for longer than the TTL.
pub struct LimiterRegistry {
    inner: Arc<RegistryInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl LimiterRegistry {
    /// Create a registry for an already validated policy configuration.
    ///
    /// The sweeper is not started; call [`start_sweeper`](Self::start_sweeper).
    pub fn new(config: &PolicyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                capacity: config.burst,
                refill_rate: config.requests_per_second,
                cleanup_interval: config.cleanup_interval(),
                ttl: config.ttl(),
                clock,
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Return the bucket for `key`, creating a full one if none exists.
    ///
    /// Insertion goes through the map's entry API, so two racing first
    /// lookups for the same key end up sharing one bucket.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        let now = self.inner.clock.now();

        // Fast path: the key is usually already present.
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.last_access = now;
            return Arc::clone(&entry.bucket);
        }

        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(
                    client = %key,
                    burst = self.inner.capacity,
                    rate = self.inner.refill_rate,
                    "Creating new token bucket"
                );
                RegistryEntry {
                    bucket: Arc::new(TokenBucket::new(
                        self.inner.capacity,
                        self.inner.refill_rate,
                        now,
                    )),
                    last_access: now,
                }
            });
        entry.last_access = now;
        Arc::clone(&entry.bucket)
    }

    /// Look up (or create) the bucket for `key` and try to take a token.
    pub fn allow(&self, key: &str) -> bool {
        let bucket = self.get_or_create(key);
        let allowed = bucket.allow(self.inner.clock.now());
        trace!(client = %key, allowed, "Checked token bucket");
        allowed
    }

    /// Remove every entry idle for longer than the TTL.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Start the periodic eviction task on the current tokio runtime.
    ///
    /// Calling this while a sweeper is already running is a no-op.
    pub fn start_sweeper(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TrackgateError::Runtime(format!("cannot start eviction sweeper: {}", e))
        })?;

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        // tokio intervals panic on a zero period
        let period = inner.cleanup_interval.max(Duration::from_millis(1));

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.sweep();
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Eviction sweeper stopped");
                        break;
                    }
                }
            }
        });

        *sweeper = Some(Sweeper { shutdown, handle });
        Ok(())
    }

    /// Stop the sweeper. Safe to call more than once.
    ///
    /// The task exits at its next wake-up; use [`shutdown`](Self::shutdown)
    /// to wait for it.
    pub fn stop(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            // The receiver is gone only if the task already exited.
            let _ = sweeper.shutdown.send(());
        }
    }

    /// Stop the sweeper and wait for its task to finish.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(());
            let _ = sweeper.handle.await;
        }
    }

    /// Whether a sweeper task is currently attached.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |s| !s.handle.is_finished())
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether a bucket exists for `key`. Does not refresh its access time.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }
}

impl RegistryInner {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();

        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_access) <= self.ttl);

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            info!(
                evicted,
                remaining = self.entries.len(),
                "Evicted idle rate limiters"
            );
        }
        evicted
    }
}

impl Drop for LimiterRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("clients", &self.inner.entries.len())
            .field("burst", &self.inner.capacity)
            .field("requests_per_second", &self.inner.refill_rate)
            .field("cleanup_interval", &self.inner.cleanup_interval)
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}
