// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A thread-safe loading cache with single-flight loads and weighted two-tier eviction.
//!
//! This crate provides [`Cache`], a keyed object cache for values that are expensive to produce
//! (decoded images, remote icons, parsed documents) and may be requested from many threads at
//! once. It combines several techniques:
//!
//! 1. **Load on demand:** a [`Loader`] supplied at construction produces values on a miss. A
//!    lookup never returns "not found"; it returns a value or the reason none is available.
//! 2. **Single-flight loads:** concurrent misses on one key are coalesced. One thread runs the
//!    loader outside the cache lock while the others block on a pending-load marker, so a slow
//!    load of one key never blocks lookups of other keys.
//! 3. **Weighted eviction:** every entry carries a popularity weight that grows on hits and is
//!    halved whenever an eviction sweep scans it. Sweeps pick the lightest entries.
//! 4. **Two retention tiers:** sweeps do not drop entries, they demote them from the strong tier
//!    (owned by the cache) to the weak tier (alive only while a client still holds the value).
//!    Dead weak entries are reaped, and [`Cache::reclaim`] drops unreferenced strong entries
//!    when the owner signals memory pressure.
//! 5. **Keyed handles:** a [`KeyedHandle`] remembers a non-owning pointer to the last value of a
//!    key and falls back to the cache when that value is gone.
//!
//! # Example
//!
//! ```
//! use keyed_cache::{Cache, GetError};
//!
//! let cache = Cache::builder(|id: &u32| {
//!     if *id == 0 {
//!         Err("no such icon")
//!     } else {
//!         Ok(format!("icon-{id}.png"))
//!     }
//! })
//! .name("icons")
//! .capacity(100)
//! .build();
//!
//! assert_eq!(*cache.get(&1).unwrap(), "icon-1.png");
//! assert!(matches!(cache.get(&0), Err(GetError::Load("no such icon"))));
//! assert_eq!(cache.stats().loads, 1);
//! assert_eq!(cache.stats().load_failures, 1);
//! ```
//!
//! # Eviction
//!
//! A bounded cache of capacity `C` (at least [`MIN_CAPACITY`]) has a high watermark of
//! `C + C/10` and a low watermark of `C - C/3`. Before a loaded value is admitted, if the strong
//! tier plus the new entry would reach the high watermark, every strong entry's weight is halved
//! and enough of the lightest are demoted to bring the strong tier down to the low watermark.
//! A cache built with capacity zero is unbounded and never sweeps.
//!
//! # Failures
//!
//! The thread that ran a failed load receives the loader's error as [`GetError::Load`]. Threads
//! that were waiting for that load receive [`GetError::Unavailable`] and should retry later. A
//! loader that panics releases its waiters with [`GetError::Abandoned`]. Waits can be bounded
//! with [`Cache::get_timeout`].
//!
//! # Consistency
//!
//! [`Cache::invalidate`] is advisory: invalidating a key while it is being loaded has no effect,
//! and the load installs its value regardless. Hit and miss counters and entry weights are updated
//! without synchronization and may lose increments under contention.

mod cache;
mod entry;
mod error;
mod eviction;
mod handle;
mod loader;
mod pending;
mod stats;

pub use cache::{Cache, CacheBuilder};
pub use entry::{Cached, INITIAL_WEIGHT};
pub use error::{GetError, Result};
pub use eviction::{MIN_CAPACITY, Watermarks};
pub use handle::KeyedHandle;
pub use loader::Loader;
pub use stats::{CacheStats, StatsReporter};

#[cfg(test)]
mod tests;
