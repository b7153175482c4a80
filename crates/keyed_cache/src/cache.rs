// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cache engine and its builder.

use std::collections::VecDeque;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::entry::{Cached, Resident, Slot};
use crate::eviction::{LightestSet, Watermarks};
use crate::handle::KeyedHandle;
use crate::loader::Loader;
use crate::pending::{Outcome, PendingLoad};
use crate::stats::{CacheStats, Counters, StatsReporter, StatsSource};
use crate::{GetError, Result};

/// Default capacity used by [`CacheBuilder`].
const DEFAULT_CAPACITY: usize = 1024;

/// Default name used in log events.
const DEFAULT_NAME: &str = "keyed_cache";

/// A thread-safe loading cache with single-flight loads and weighted two-tier eviction.
///
/// Values are produced on demand by a [`Loader`]. Concurrent requests for a key that is not
/// resident are coalesced: one thread runs the loader while the others block until it finishes.
///
/// Every entry carries a weight that starts at [`INITIAL_WEIGHT`](crate::INITIAL_WEIGHT), grows
/// on each hit and is halved whenever an eviction sweep scans it. When admitting a new entry
/// would push the strong tier to its high watermark, the lightest strong entries are demoted to
/// the weak tier, where they stay reachable only while some client still holds them.
///
/// `Cache` is a cheap handle over shared state; clones refer to the same cache.
///
/// # Examples
///
/// ```
/// use keyed_cache::Cache;
///
/// let cache = Cache::new(100, |id: &u64| Ok::<_, std::io::Error>(format!("user-{id}")));
///
/// let first = cache.get(&7)?;
/// let second = cache.get(&7)?;
/// assert_eq!(*first, "user-7");
/// assert!(keyed_cache::Cached::ptr_eq(&first, &second));
/// assert_eq!(cache.hits(), 1);
/// assert_eq!(cache.misses(), 1);
/// # Ok::<(), keyed_cache::GetError<std::io::Error>>(())
/// ```
pub struct Cache<K, V, L> {
    inner: Arc<Inner<K, V, L>>,
}

struct Inner<K, V, L> {
    name: &'static str,
    loader: L,
    /// `None` for an unbounded cache.
    watermarks: Option<Watermarks>,
    weak_capacity: usize,
    state: RwLock<State<K, V>>,
    counters: Counters,
    reporting: AtomicBool,
}

/// Everything guarded by the cache lock.
struct State<K, V> {
    map: HashMap<K, Slot<V>>,
    pending: HashMap<K, Arc<PendingLoad<V>>>,
    /// Weak-tier records in demotion order, used for reaping and weak-tier trimming.
    /// May contain records for keys that have since been removed or reloaded.
    demoted: VecDeque<(K, Weak<Resident<V>>)>,
    strong_len: usize,
    weak_len: usize,
}

enum Claim<V> {
    Hit(Cached<V>),
    Wait(Arc<PendingLoad<V>>),
    Load(Arc<PendingLoad<V>>),
}

impl<K, V> State<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity + capacity / 3),
            pending: HashMap::new(),
            demoted: VecDeque::new(),
            strong_len: 0,
            weak_len: 0,
        }
    }

    fn uncount(&mut self, slot: &Slot<V>) {
        if slot.is_strong() {
            self.strong_len -= 1;
        } else {
            self.weak_len -= 1;
        }
    }

    /// Removes and retires the entry for `key`.
    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.map.remove(key)?;
        self.uncount(&slot);
        slot.retire();
        Some(slot)
    }

    /// Installs a freshly loaded entry in the strong tier.
    fn install(&mut self, key: K, cached: Cached<V>) -> Option<Slot<V>> {
        self.strong_len += 1;
        let previous = self.map.insert(key, Slot::Strong(cached));
        debug_assert!(previous.is_none(), "a key is only installed by the thread holding its pending load");
        if let Some(previous) = &previous {
            self.uncount(previous);
            previous.retire();
        }
        previous
    }

    /// Moves a strong entry to the weak tier, returning the strong pointer the map gave up.
    fn demote(&mut self, key: &K) -> Option<Cached<V>> {
        let slot = self.map.get_mut(key)?;
        let Slot::Strong(cached) = &*slot else {
            return None;
        };
        let weak = cached.downgrade();
        let Slot::Strong(cached) = std::mem::replace(slot, Slot::Weak(weak.clone())) else {
            return None;
        };
        self.strong_len -= 1;
        self.weak_len += 1;
        self.demoted.push_back((key.clone(), weak));
        Some(cached)
    }

    /// Removes the pending marker for `key` if it is still `pending`.
    fn forget_pending(&mut self, key: &K, pending: &Arc<PendingLoad<V>>) {
        if self.pending.get(key).is_some_and(|current| Arc::ptr_eq(current, pending)) {
            self.pending.remove(key);
        }
    }

    /// Purges weak-tier entries whose value is gone.
    ///
    /// A record only removes the map entry if the map still holds that exact weak pointer, so a
    /// key that was reloaded after being demoted is left alone. Records whose entry has already
    /// left the map are discarded even while a client keeps the value alive.
    fn reap(&mut self) -> usize {
        let Self {
            map, demoted, weak_len, ..
        } = self;
        let mut reaped = 0;
        demoted.retain(|(key, weak)| {
            let current = matches!(map.get(key), Some(Slot::Weak(current)) if Weak::ptr_eq(current, weak));
            if !current {
                return false;
            }
            if weak.strong_count() > 0 {
                return true;
            }
            map.remove(key);
            *weak_len -= 1;
            reaped += 1;
            false
        });
        reaped
    }

    /// Drops the oldest weak-tier entries until at most `limit` remain.
    fn trim_weak(&mut self, limit: usize) -> Vec<Slot<V>> {
        let mut dropped = Vec::new();
        while self.weak_len > limit {
            let Some((key, weak)) = self.demoted.pop_front() else {
                break;
            };
            let matches = matches!(self.map.get(&key), Some(Slot::Weak(current)) if Weak::ptr_eq(current, &weak));
            if matches && let Some(slot) = self.remove(&key) {
                dropped.push(slot);
            }
        }
        dropped
    }
}

impl<K, V, L> Cache<K, V, L>
where
    K: Eq + Hash + Clone,
    L: Loader<K, V>,
{
    /// Creates a cache with the given capacity.
    ///
    /// A capacity of zero makes the cache unbounded; any other capacity below
    /// [`MIN_CAPACITY`](crate::MIN_CAPACITY) is raised to it.
    #[must_use]
    pub fn new(capacity: usize, loader: L) -> Self {
        CacheBuilder::new(loader).capacity(capacity).build()
    }

    /// Creates a builder for a cache that loads values with `loader`.
    #[must_use]
    pub fn builder(loader: L) -> CacheBuilder<K, V, L> {
        CacheBuilder::new(loader)
    }

    /// Returns the value for `key`, loading it if it is not resident.
    ///
    /// Blocks while another thread loads the same key, or while this thread runs the loader.
    ///
    /// # Errors
    ///
    /// * [`GetError::Load`] if this thread ran the loader and it failed.
    /// * [`GetError::Unavailable`] if this thread waited on another thread's load, which failed.
    /// * [`GetError::Abandoned`] if the thread loading the key panicked.
    pub fn get(&self, key: &K) -> Result<Cached<V>, L::Error> {
        self.resolve(key, None)
    }

    /// Like [`get`](Self::get), but gives up waiting on another thread's load after `timeout`.
    ///
    /// The timeout bounds only the wait for a concurrent load. If this thread ends up running the
    /// loader itself, the call takes as long as the loader does. A timed-out wait does not affect
    /// the load, which still installs its result.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`GetError::TimedOut`] when the wait expires.
    pub fn get_timeout(&self, key: &K, timeout: Duration) -> Result<Cached<V>, L::Error> {
        self.resolve(key, Some(timeout))
    }

    fn resolve(&self, key: &K, timeout: Option<Duration>) -> Result<Cached<V>, L::Error> {
        if let Some(cached) = self.peek(key) {
            return Ok(cached);
        }

        match self.claim(key) {
            Claim::Hit(cached) => Ok(cached),
            Claim::Wait(pending) => Self::wait(&pending, timeout),
            Claim::Load(pending) => self.load(key, &pending),
        }
    }

    /// Re-checks the key under the lock and either finds it, joins a pending load, or starts one.
    fn claim(&self, key: &K) -> Claim<V> {
        let mut state = self.inner.state.write();

        match state.map.get(key).map(Slot::resolve) {
            Some(Some(cached)) => {
                cached.resident().touch();
                self.inner.counters.hit();
                return Claim::Hit(cached);
            }
            // The weak-tier value is gone.
            Some(None) => {
                state.remove(key);
                self.inner.counters.reaped(1);
            }
            None => {}
        }

        self.inner.counters.miss();
        if let Some(pending) = state.pending.get(key) {
            return Claim::Wait(Arc::clone(pending));
        }

        let pending = Arc::new(PendingLoad::new());
        state.pending.insert(key.clone(), Arc::clone(&pending));
        Claim::Load(pending)
    }

    fn wait(pending: &PendingLoad<V>, timeout: Option<Duration>) -> Result<Cached<V>, L::Error> {
        let outcome = match timeout {
            Some(timeout) => pending.wait_timeout(timeout).ok_or(GetError::TimedOut)?,
            None => pending.wait(),
        };
        match outcome {
            Outcome::Loaded(cached) => Ok(cached),
            Outcome::Failed => Err(GetError::Unavailable),
            Outcome::Abandoned => Err(GetError::Abandoned),
        }
    }

    /// Runs the loader outside the lock and publishes the outcome.
    fn load(&self, key: &K, pending: &Arc<PendingLoad<V>>) -> Result<Cached<V>, L::Error> {
        let mut guard = LoadGuard {
            cache: self,
            key,
            pending,
            armed: true,
        };

        tracing::debug!(cache.name = self.inner.name, "cache.load");
        let loaded = self.inner.loader.load(key);

        let outcome = match loaded {
            Ok(value) => {
                let cached = Cached::from_resident(Arc::new(Resident::new(value)));
                let released = {
                    let mut state = self.inner.state.write();
                    let released = self.admit(&mut state);
                    let replaced = state.install(key.clone(), cached.clone());
                    state.forget_pending(key, pending);
                    (released, replaced)
                };
                drop(released);
                self.inner.counters.loaded();
                Ok(cached)
            }
            Err(error) => {
                self.inner.state.write().forget_pending(key, pending);
                self.inner.counters.load_failed();
                tracing::debug!(cache.name = self.inner.name, "cache.load.failed");
                Err(error)
            }
        };

        guard.armed = false;
        match outcome {
            Ok(cached) => {
                pending.resolve(Outcome::Loaded(cached.clone()));
                Ok(cached)
            }
            Err(error) => {
                pending.resolve(Outcome::Failed);
                Err(GetError::Load(error))
            }
        }
    }

    /// Makes room for one more strong entry.
    ///
    /// Returns the strong pointers and slots the map gave up, so their values can be dropped
    /// after the lock is released.
    fn admit(&self, state: &mut State<K, V>) -> (Vec<Cached<V>>, Vec<Slot<V>>) {
        let reaped = state.reap();
        if reaped > 0 {
            self.inner.counters.reaped(reaped);
            tracing::trace!(cache.name = self.inner.name, cache.reaped = reaped, "cache.reap");
        }

        let Some(remove_count) = self.inner.watermarks.and_then(|marks| marks.demotions_needed(state.strong_len)) else {
            return (Vec::new(), Vec::new());
        };

        let mut lightest = LightestSet::new(remove_count);
        let mut scanned = 0_usize;
        for (key, slot) in &state.map {
            if let Slot::Strong(cached) = slot {
                scanned += 1;
                lightest.offer(cached.resident().decay(), key);
            }
        }
        let victims: Vec<K> = lightest.into_items().cloned().collect();

        let demoted: Vec<Cached<V>> = victims.iter().filter_map(|key| state.demote(key)).collect();
        self.inner.counters.demoted(demoted.len());

        let trimmed = state.trim_weak(self.inner.weak_capacity);

        tracing::debug!(
            cache.name = self.inner.name,
            cache.scanned = scanned,
            cache.demoted = demoted.len(),
            cache.trimmed = trimmed.len(),
            cache.strong_len = state.strong_len,
            cache.weak_len = state.weak_len,
            "cache.sweep"
        );

        (demoted, trimmed)
    }

    /// Returns the value for `key` if it is resident, without loading it.
    ///
    /// A successful peek counts as a hit and bumps the entry's weight; a failed one is not
    /// counted as a miss.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<Cached<V>> {
        let cached = self.inner.state.read().map.get(key)?.resolve()?;
        cached.resident().touch();
        self.inner.counters.hit();
        Some(cached)
    }

    /// Removes the entry for `key`.
    ///
    /// Invalidation is advisory: while a load for `key` is in flight it does nothing and the load
    /// still installs its result. Returns `true` if an entry was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut state = self.inner.state.write();
        if state.pending.contains_key(key) {
            tracing::debug!(cache.name = self.inner.name, "cache.invalidate.ignored");
            return false;
        }
        let removed = state.remove(key);
        drop(state);
        removed.is_some()
    }

    /// Purges weak-tier entries whose value is gone and returns how many were purged.
    ///
    /// This also happens automatically before every admission.
    pub fn reap(&self) -> usize {
        let reaped = self.inner.state.write().reap();
        self.inner.counters.reaped(reaped);
        reaped
    }

    /// Responds to memory pressure by dropping every strong-tier entry that no client holds.
    ///
    /// Entries still referenced elsewhere stay in the strong tier. Dead weak-tier entries are
    /// reaped as well. Returns the number of strong entries dropped.
    pub fn reclaim(&self) -> usize {
        let mut state = self.inner.state.write();
        let released: Vec<(K, Slot<V>)> = state
            .map
            .extract_if(|_, slot| match slot {
                Slot::Strong(cached) => Arc::strong_count(cached.resident()) == 1,
                Slot::Weak(_) => false,
            })
            .collect();
        for (_, slot) in &released {
            slot.retire();
        }
        state.strong_len -= released.len();
        let reaped = state.reap();
        let (strong_len, weak_len) = (state.strong_len, state.weak_len);
        drop(state);

        self.inner.counters.reclaimed(released.len());
        self.inner.counters.reaped(reaped);
        tracing::debug!(
            cache.name = self.inner.name,
            cache.reclaimed = released.len(),
            cache.reaped = reaped,
            cache.strong_len = strong_len,
            cache.weak_len = weak_len,
            "cache.reclaim"
        );
        released.len()
    }

    /// Returns a handle that resolves `key` through this cache.
    #[must_use]
    pub fn handle(&self, key: K) -> KeyedHandle<K, V, L> {
        KeyedHandle::new(self.clone(), key)
    }

    /// Returns `true` if `key` is resident in the strong tier.
    #[must_use]
    pub fn contains_strong(&self, key: &K) -> bool {
        self.inner.state.read().map.get(key).is_some_and(Slot::is_strong)
    }

    /// Returns `true` if `key` has a weak-tier entry whose value is still alive.
    #[must_use]
    pub fn contains_weak(&self, key: &K) -> bool {
        self.inner
            .state
            .read()
            .map
            .get(key)
            .is_some_and(|slot| !slot.is_strong() && slot.resolve().is_some())
    }
}

impl<K, V, L> Cache<K, V, L> {
    /// Returns the name used in log events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns the nominal capacity, or `None` for an unbounded cache.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.inner.watermarks.map(|marks| marks.capacity())
    }

    /// Returns the eviction watermarks, or `None` for an unbounded cache.
    #[must_use]
    pub fn watermarks(&self) -> Option<Watermarks> {
        self.inner.watermarks
    }

    /// Returns the total number of entries in both tiers.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.inner.state.read();
        state.strong_len + state.weak_len
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of entries in the strong tier.
    #[must_use]
    pub fn strong_len(&self) -> usize {
        self.inner.state.read().strong_len
    }

    /// Returns the number of entries in the weak tier, including ones not yet reaped.
    #[must_use]
    pub fn weak_len(&self) -> usize {
        self.inner.state.read().weak_len
    }

    /// Returns the number of lookups answered from a resident entry.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.inner.counters.hits()
    }

    /// Returns the number of lookups that started or joined a load.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.inner.counters.misses()
    }

    /// Returns a snapshot of the cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<K, V, L> Cache<K, V, L>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    /// Starts logging the hit ratio every `period` on a background thread.
    ///
    /// Returns `None` if a reporter is already running for this cache or the thread could not be
    /// started. The reporter holds no strong reference to the cache and stops once the cache is
    /// dropped.
    #[must_use]
    pub fn report_stats(&self, period: Duration) -> Option<StatsReporter> {
        if self.inner.reporting.swap(true, Ordering::AcqRel) {
            return None;
        }
        match StatsReporter::spawn(self.inner.name, period, Arc::downgrade(&self.inner)) {
            Ok(reporter) => Some(reporter),
            Err(error) => {
                self.inner.reporting.store(false, Ordering::Release);
                tracing::warn!(cache.name = self.inner.name, error = %error, "cache.stats.spawn_failed");
                None
            }
        }
    }
}

impl<K, V, L> Inner<K, V, L> {
    fn stats(&self) -> CacheStats {
        let (strong_len, weak_len) = {
            let state = self.state.read();
            (state.strong_len, state.weak_len)
        };
        self.counters.snapshot(strong_len, weak_len)
    }
}

impl<K, V, L> StatsSource for Weak<Inner<K, V, L>>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    fn snapshot(&self) -> Option<CacheStats> {
        self.upgrade().map(|inner| inner.stats())
    }

    fn reporter_stopped(&self) {
        if let Some(inner) = self.upgrade() {
            inner.reporting.store(false, Ordering::Release);
        }
    }
}

impl<K, V, L> Clone for Cache<K, V, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, L> std::fmt::Debug for Cache<K, V, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("watermarks", &self.inner.watermarks)
            .field("strong_len", &state.strong_len)
            .field("weak_len", &state.weak_len)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

/// Resolves a pending load as abandoned if the loading thread unwinds.
struct LoadGuard<'a, K, V, L>
where
    K: Eq + Hash + Clone,
    L: Loader<K, V>,
{
    cache: &'a Cache<K, V, L>,
    key: &'a K,
    pending: &'a Arc<PendingLoad<V>>,
    armed: bool,
}

impl<K, V, L> Drop for LoadGuard<'_, K, V, L>
where
    K: Eq + Hash + Clone,
    L: Loader<K, V>,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cache.inner.state.write().forget_pending(self.key, self.pending);
        self.pending.resolve(Outcome::Abandoned);
        tracing::warn!(cache.name = self.cache.inner.name, "cache.load.abandoned");
    }
}

/// Builder for configuring a [`Cache`].
///
/// # Examples
///
/// ```
/// use keyed_cache::Cache;
///
/// let cache = Cache::builder(|path: &String| std::fs::read(path))
///     .name("thumbnails")
///     .capacity(500)
///     .weak_capacity(2000)
///     .build();
///
/// assert_eq!(cache.capacity(), Some(500));
/// assert_eq!(cache.name(), "thumbnails");
/// ```
pub struct CacheBuilder<K, V, L> {
    loader: L,
    capacity: usize,
    weak_capacity: Option<usize>,
    name: &'static str,
    _marker: PhantomData<fn(&K) -> V>,
}

impl<K, V, L> CacheBuilder<K, V, L>
where
    K: Eq + Hash + Clone,
    L: Loader<K, V>,
{
    /// Creates a builder with default settings.
    ///
    /// Defaults:
    /// - `capacity`: 1024
    /// - `weak_capacity`: same as the capacity
    /// - `name`: `"keyed_cache"`
    #[must_use]
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            capacity: DEFAULT_CAPACITY,
            weak_capacity: None,
            name: DEFAULT_NAME,
            _marker: PhantomData,
        }
    }

    /// Sets the strong-tier capacity.
    ///
    /// Zero makes the cache unbounded: no eviction sweeps run and the cache only shrinks through
    /// [`Cache::reclaim`] and invalidation. Non-zero values below
    /// [`MIN_CAPACITY`](crate::MIN_CAPACITY) are raised to it.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Makes the cache unbounded. Equivalent to `capacity(0)`.
    #[must_use]
    pub const fn unbounded(self) -> Self {
        self.capacity(0)
    }

    /// Sets how many demoted entries the weak tier may hold before the oldest are dropped.
    #[must_use]
    pub const fn weak_capacity(mut self, weak_capacity: usize) -> Self {
        self.weak_capacity = Some(weak_capacity);
        self
    }

    /// Sets the name used in log events.
    #[must_use]
    pub const fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Builds the cache.
    #[must_use]
    pub fn build(self) -> Cache<K, V, L> {
        let watermarks = (self.capacity > 0).then(|| Watermarks::for_capacity(self.capacity));
        let capacity = watermarks.map_or(0, |marks| marks.capacity());
        let weak_capacity = self.weak_capacity.unwrap_or(capacity);

        Cache {
            inner: Arc::new(Inner {
                name: self.name,
                loader: self.loader,
                watermarks,
                weak_capacity,
                state: RwLock::new(State::new(capacity)),
                counters: Counters::default(),
                reporting: AtomicBool::new(false),
            }),
        }
    }
}

impl<K, V, L> std::fmt::Debug for CacheBuilder<K, V, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("capacity", &self.capacity)
            .field("weak_capacity", &self.weak_capacity)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
