// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The loader contract used by the cache to produce values on a miss.

/// Produces the value for a key when the cache does not hold one.
///
/// A loader may block (file or network I/O, decoding, rendering). The cache guarantees that
/// `load` is never running twice at the same time for the same key, but it may run concurrently
/// for different keys, so implementations must be `Send + Sync`.
///
/// Any `Fn(&K) -> Result<V, E>` closure is a loader:
///
/// ```
/// use keyed_cache::Cache;
///
/// let cache = Cache::new(100, |key: &u32| Ok::<_, std::io::Error>(key.to_string()));
/// assert_eq!(*cache.get(&7).unwrap(), "7");
/// ```
pub trait Loader<K, V>: Send + Sync {
    /// The error returned when the value cannot be produced.
    type Error;

    /// Loads the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns the loader's own error when the value cannot be produced. The error is
    /// delivered only to the thread that ran the load.
    fn load(&self, key: &K) -> Result<V, Self::Error>;
}

impl<K, V, E, F> Loader<K, V> for F
where
    F: Fn(&K) -> Result<V, E> + Send + Sync,
{
    type Error = E;

    fn load(&self, key: &K) -> Result<V, E> {
        self(key)
    }
}
