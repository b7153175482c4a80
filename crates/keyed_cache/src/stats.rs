// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache statistics and the periodic statistics reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Relaxed event counters.
///
/// Increments are not ordered with respect to the map, so a snapshot taken while other threads
/// are working is approximate.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    demotions: AtomicU64,
    reaped: AtomicU64,
    reclaimed: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loaded(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn load_failed(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn demoted(&self, count: usize) {
        self.demotions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn reaped(&self, count: usize) {
        self.reaped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn reclaimed(&self, count: usize) {
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self, strong_len: usize, weak_len: usize) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            strong_len,
            weak_len,
        }
    }
}

/// A point-in-time view of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheStats {
    /// Lookups answered from a resident entry.
    pub hits: u64,
    /// Lookups that started or joined a load.
    pub misses: u64,
    /// Loads that produced a value.
    pub loads: u64,
    /// Loads whose loader returned an error.
    pub load_failures: u64,
    /// Entries moved from the strong tier to the weak tier by eviction sweeps.
    pub demotions: u64,
    /// Dead weak-tier entries purged from the map.
    pub reaped: u64,
    /// Strong-tier entries dropped by memory reclamation.
    pub reclaimed: u64,
    /// Entries currently in the strong tier.
    pub strong_len: usize,
    /// Entries currently in the weak tier, including ones whose value may already be gone.
    pub weak_len: usize,
}

impl CacheStats {
    /// Returns the total number of lookups.
    #[must_use]
    pub const fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    /// Returns the fraction of lookups that were hits, or `None` before the first lookup.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "a ratio does not need more than 52 bits of precision")]
    pub fn hit_ratio(&self) -> Option<f64> {
        let accesses = self.accesses();
        (accesses > 0).then(|| self.hits as f64 / accesses as f64)
    }
}

/// Source of statistics for a reporter thread.
pub(crate) trait StatsSource: Send + Sync + 'static {
    /// Returns a snapshot, or `None` once the cache is gone.
    fn snapshot(&self) -> Option<CacheStats>;

    /// Called from the reporter thread when it exits.
    fn reporter_stopped(&self);
}

/// Periodically logs the hit ratio of a cache.
///
/// Created by [`Cache::report_stats`](crate::Cache::report_stats). The reporter runs on its own
/// named thread, logging an `info` event every period. It stops when dropped or when the cache
/// itself has been dropped.
#[derive(Debug)]
pub struct StatsReporter {
    stop: std::sync::Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Waits for `period` and returns `true` if the reporter was asked to stop meanwhile.
    fn wait(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.wake.wait_for(&mut stopped, period);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

impl StatsReporter {
    pub(crate) fn spawn<S: StatsSource>(name: &'static str, period: Duration, source: S) -> std::io::Result<Self> {
        let stop = std::sync::Arc::new(StopSignal::default());
        let thread_stop = std::sync::Arc::clone(&stop);
        let parent = tracing::Span::current();

        let thread = thread::Builder::new()
            .name(format!("{name}.stats"))
            .spawn(move || {
                let _entered = parent.enter();
                while !thread_stop.wait(period) {
                    let Some(stats) = source.snapshot() else {
                        break;
                    };
                    if stats.accesses() > 0 {
                        tracing::info!(
                            cache.name = name,
                            cache.hits = stats.hits,
                            cache.misses = stats.misses,
                            cache.accesses = stats.accesses(),
                            cache.hit_ratio = stats.hit_ratio().unwrap_or_default(),
                            cache.strong_len = stats.strong_len,
                            cache.weak_len = stats.weak_len,
                            "cache.stats"
                        );
                    }
                }
                source.reporter_stopped();
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the reporter and waits for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("cache statistics reporter panicked");
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
