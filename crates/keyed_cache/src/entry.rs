// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resident entries and the two retention tiers of a cache slot.
//!
//! A loaded value lives in a [`Resident`] shared through an [`Arc`]. The cache map holds either
//! a strong pointer (the entry is retained by the cache) or only a [`Weak`] pointer (the entry
//! lost an eviction round and survives only while some client still holds it).

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Weight given to every freshly loaded entry.
pub const INITIAL_WEIGHT: u32 = 100;

/// A loaded value together with its eviction bookkeeping.
pub(crate) struct Resident<V> {
    value: V,

    /// Decayed popularity estimate. Updated with relaxed load/store pairs, so concurrent hits may
    /// lose increments.
    weight: AtomicU32,

    /// Set once the entry has left the cache map. A retired entry is never handed out again by
    /// the cache or by a handle.
    retired: AtomicBool,
}

impl<V> Resident<V> {
    pub(crate) fn new(value: V) -> Self {
        Self {
            value,
            weight: AtomicU32::new(INITIAL_WEIGHT),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Records one access.
    pub(crate) fn touch(&self) {
        let weight = self.weight.load(Ordering::Relaxed);
        self.weight.store(weight.saturating_add(1), Ordering::Relaxed);
    }

    /// Halves the weight and returns the decayed value.
    pub(crate) fn decay(&self) -> u32 {
        let weight = self.weight.load(Ordering::Relaxed) / 2;
        self.weight.store(weight, Ordering::Relaxed);
        weight
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// A value handed out by the cache.
///
/// `Cached` is a cheap, clonable shared pointer that dereferences to the loaded value. Holding
/// one keeps the value alive even after the cache has demoted or dropped its own reference, so
/// long-lived owners that only want "the current value of a key" should prefer a
/// [`KeyedHandle`](crate::KeyedHandle).
pub struct Cached<V> {
    inner: Arc<Resident<V>>,
}

impl<V> Cached<V> {
    pub(crate) const fn from_resident(inner: Arc<Resident<V>>) -> Self {
        Self { inner }
    }

    pub(crate) const fn resident(&self) -> &Arc<Resident<V>> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<Resident<V>> {
        Arc::downgrade(&self.inner)
    }

    /// Returns the current weight of the entry.
    ///
    /// The weight starts at [`INITIAL_WEIGHT`], grows by one on every access and is halved each
    /// time an eviction sweep scans the entry.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.inner.weight()
    }

    /// Returns `true` if the entry has left the cache (invalidated, reaped or reclaimed).
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.is_retired()
    }

    /// Returns `true` if both values come from the same load.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<V> Clone for Cached<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Deref for Cached<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner.value
    }
}

impl<V> AsRef<V> for Cached<V> {
    fn as_ref(&self) -> &V {
        &self.inner.value
    }
}

impl<V: fmt::Debug> fmt::Debug for Cached<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("value", &self.inner.value)
            .field("weight", &self.weight())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// A map slot, holding an entry in one of the two retention tiers.
pub(crate) enum Slot<V> {
    /// Retained by the cache.
    Strong(Cached<V>),
    /// Demoted; alive only while a client still holds the value.
    Weak(Weak<Resident<V>>),
}

impl<V> Slot<V> {
    /// Returns the live, non-retired entry behind this slot.
    pub(crate) fn resolve(&self) -> Option<Cached<V>> {
        match self {
            Self::Strong(cached) => Some(cached.clone()),
            Self::Weak(weak) => weak
                .upgrade()
                .filter(|resident| !resident.is_retired())
                .map(Cached::from_resident),
        }
    }

    pub(crate) const fn is_strong(&self) -> bool {
        matches!(self, Self::Strong(_))
    }

    /// Marks the entry behind this slot as retired, if it is still alive.
    pub(crate) fn retire(&self) {
        match self {
            Self::Strong(cached) => cached.resident().retire(),
            Self::Weak(weak) => {
                if let Some(resident) = weak.upgrade() {
                    resident.retire();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_lifecycle() {
        let resident = Resident::new("value");
        assert_eq!(resident.weight(), INITIAL_WEIGHT);

        resident.touch();
        resident.touch();
        assert_eq!(resident.weight(), 102);

        assert_eq!(resident.decay(), 51);
        assert_eq!(resident.decay(), 25);
        assert_eq!(resident.weight(), 25);
    }

    #[test]
    fn touch_saturates() {
        let resident = Resident::new(());
        resident.weight.store(u32::MAX, Ordering::Relaxed);
        resident.touch();
        assert_eq!(resident.weight(), u32::MAX);
    }

    #[test]
    fn weak_slot_resolves_only_while_held() {
        let cached = Cached::from_resident(Arc::new(Resident::new(7)));
        let slot = Slot::Weak(cached.downgrade());
        assert!(!slot.is_strong());

        let resolved = slot.resolve().expect("value is still held");
        assert!(Cached::ptr_eq(&resolved, &cached));

        drop(resolved);
        drop(cached);
        assert!(slot.resolve().is_none());
    }

    #[test]
    fn retired_weak_slot_does_not_resolve() {
        let cached = Cached::from_resident(Arc::new(Resident::new(7)));
        let slot = Slot::Weak(cached.downgrade());
        slot.retire();

        assert!(cached.is_retired());
        assert!(slot.resolve().is_none());
    }

    #[test]
    fn cached_derefs_to_value() {
        let cached = Cached::from_resident(Arc::new(Resident::new(String::from("abc"))));
        assert_eq!(cached.len(), 3);
        assert_eq!(cached.as_ref(), "abc");
        assert!(format!("{cached:?}").contains("abc"));
    }
}
