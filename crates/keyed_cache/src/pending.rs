// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pending-load markers used to coalesce concurrent loads of one key.
//!
//! The first caller that misses on a key installs a [`PendingLoad`] and runs the loader; every
//! other caller for the same key blocks on the marker until the loading thread resolves it. The
//! marker is a single-assignment slot: once resolved, every waiter observes the same outcome.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::entry::Cached;

/// How a pending load ended.
pub(crate) enum Outcome<V> {
    /// The loader produced a value, now installed in the cache.
    Loaded(Cached<V>),
    /// The loader returned an error.
    Failed,
    /// The loading thread unwound before publishing a result.
    Abandoned,
}

impl<V> Clone for Outcome<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Loaded(cached) => Self::Loaded(cached.clone()),
            Self::Failed => Self::Failed,
            Self::Abandoned => Self::Abandoned,
        }
    }
}

/// A load in flight for one key.
pub(crate) struct PendingLoad<V> {
    slot: Mutex<Option<Outcome<V>>>,
    resolved: Condvar,
}

impl<V> PendingLoad<V> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    /// Publishes the outcome and wakes all waiters.
    ///
    /// Only the first resolution is kept; returns `false` if the marker was already resolved.
    pub(crate) fn resolve(&self, outcome: Outcome<V>) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.resolved.notify_all();
        true
    }

    /// Blocks until the marker is resolved.
    pub(crate) fn wait(&self) -> Outcome<V> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.resolved.wait(&mut slot);
        }
    }

    /// Blocks until the marker is resolved or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<V>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.resolved.wait_until(&mut slot, deadline).timed_out() {
                        return slot.as_ref().cloned();
                    }
                }
                // A timeout too large to represent is a plain wait.
                None => self.resolved.wait(&mut slot),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_resolved(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<V> std::fmt::Debug for PendingLoad<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLoad")
            .field("resolved", &self.slot.lock().is_some())
            .finish()
    }
}
