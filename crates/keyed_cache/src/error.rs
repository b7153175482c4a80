// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors returned when the cache cannot produce a value.

/// The result of resolving a key through the cache.
pub type Result<T, E> = std::result::Result<T, GetError<E>>;

/// An error returned when the cache cannot produce a value for a key.
///
/// Only the thread that actually ran the loader sees the loader's own error ([`GetError::Load`]).
/// Threads that were waiting on that load receive [`GetError::Unavailable`] instead and should
/// treat it as a transient miss.
///
/// # Examples
///
/// ```
/// use keyed_cache::{Cache, GetError};
///
/// let cache = Cache::new(10, |_: &u8| Err::<String, _>("offline"));
///
/// match cache.get(&1) {
///     Err(GetError::Load(reason)) => assert_eq!(reason, "offline"),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GetError<E> {
    /// The loader failed on this thread.
    #[error("loading the cache entry failed")]
    Load(#[source] E),

    /// Another thread's load of the same key failed; no value is available this round.
    #[error("the cache entry is unavailable, a concurrent load failed")]
    Unavailable,

    /// The thread loading this key panicked before publishing a result.
    #[error("the concurrent load of the cache entry was abandoned")]
    Abandoned,

    /// Gave up waiting for another thread's load of the same key.
    #[error("timed out waiting for a concurrent load of the cache entry")]
    TimedOut,
}

impl<E> GetError<E> {
    /// Returns `true` if the failure belongs to another thread's load, so a retry may succeed
    /// without anything changing on this side.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Load(_))
    }

    /// Returns the loader error, if this thread ran the failed load.
    #[must_use]
    pub fn into_load_error(self) -> Option<E> {
        match self {
            Self::Load(error) => Some(error),
            _ => None,
        }
    }
}
