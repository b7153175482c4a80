// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Long-lived stand-ins for a cache key.

use std::hash::Hash;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::entry::{Cached, Resident};
use crate::loader::Loader;
use crate::{Cache, Result};

/// A cheap, repeatedly dereferenceable stand-in for "the current value of a key".
///
/// A handle is meant for owners that need the same key's value over and over (a table cell
/// showing an icon, a row showing a thumbnail) without holding a strong reference that would
/// keep the value alive after the cache has let go of it.
///
/// The handle remembers a non-owning pointer to the last value it resolved. As long as that value
/// is alive and still belongs to the cache, [`get`](Self::get) returns it without touching the
/// cache lock. Once the value is gone, or the cache invalidated or dropped the entry, the handle
/// resolves the key through [`Cache::get`] again.
///
/// # Examples
///
/// ```
/// use keyed_cache::Cache;
///
/// let cache = Cache::new(10, |name: &String| Ok::<_, std::io::Error>(name.to_uppercase()));
/// let handle = cache.handle("icon".to_string());
///
/// assert_eq!(handle.with(|value| value.len())?, 4);
/// assert_eq!(*handle.get()?, "ICON");
/// # Ok::<(), keyed_cache::GetError<std::io::Error>>(())
/// ```
pub struct KeyedHandle<K, V, L> {
    cache: Cache<K, V, L>,
    key: K,
    last: Mutex<Weak<Resident<V>>>,
}

impl<K, V, L> KeyedHandle<K, V, L>
where
    K: Eq + Hash + Clone,
    L: Loader<K, V>,
{
    /// Creates a handle for `key` in `cache`.
    #[must_use]
    pub fn new(cache: Cache<K, V, L>, key: K) -> Self {
        Self {
            cache,
            key,
            last: Mutex::new(Weak::new()),
        }
    }

    /// Returns the current value of the key.
    ///
    /// A value served from the remembered pointer bumps the entry's weight but is not counted
    /// as a cache hit; a value resolved through the cache is counted exactly like [`Cache::get`].
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Cache::get`] when the key has to be resolved through the cache.
    pub fn get(&self) -> Result<Cached<V>, L::Error> {
        if let Some(cached) = self.remembered() {
            cached.resident().touch();
            return Ok(cached);
        }

        let cached = self.cache.get(&self.key)?;
        *self.last.lock() = cached.downgrade();
        Ok(cached)
    }

    /// Runs `f` against the current value of the key.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Cache::get`] when the key has to be resolved through the cache.
    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> Result<R, L::Error> {
        let cached = self.get()?;
        Ok(f(&cached))
    }

    fn remembered(&self) -> Option<Cached<V>> {
        let resident = self.last.lock().upgrade()?;
        (!resident.is_retired()).then(|| Cached::from_resident(resident))
    }
}

impl<K, V, L> KeyedHandle<K, V, L> {
    /// Returns the key this handle stands for.
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Returns the cache this handle resolves through.
    #[must_use]
    pub const fn cache(&self) -> &Cache<K, V, L> {
        &self.cache
    }

    /// Drops the remembered pointer so the next [`get`](Self::get) goes through the cache.
    pub fn forget(&self) {
        *self.last.lock() = Weak::new();
    }
}

impl<K: std::fmt::Debug, V, L> std::fmt::Debug for KeyedHandle<K, V, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedHandle")
            .field("key", &self.key)
            .field("resolved", &(self.last.lock().strong_count() > 0))
            .finish_non_exhaustive()
    }
}
