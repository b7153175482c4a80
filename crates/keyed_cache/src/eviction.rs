// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Watermarks and victim selection for the weighted eviction sweep.
//!
//! A sweep runs only when admitting one more entry would bring the strong tier to the high
//! watermark. It then selects enough of the lightest strong entries to bring the tier back down
//! to the low watermark; the selected entries are demoted to the weak tier, not dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Smallest capacity a bounded cache will accept. Smaller non-zero capacities are raised to it.
pub const MIN_CAPACITY: usize = 10;

/// Thresholds that trigger and bound an eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    capacity: usize,
    high: usize,
    low: usize,
}

impl Watermarks {
    /// Computes the watermarks for a bounded capacity.
    ///
    /// The capacity is raised to [`MIN_CAPACITY`] first. The high watermark is the capacity plus
    /// 10%, the low watermark is the capacity minus 33%.
    ///
    /// # Examples
    ///
    /// ```
    /// use keyed_cache::Watermarks;
    ///
    /// let marks = Watermarks::for_capacity(3);
    /// assert_eq!(marks.capacity(), 10);
    /// assert_eq!(marks.high(), 11);
    /// assert_eq!(marks.low(), 7);
    /// ```
    #[must_use]
    pub const fn for_capacity(capacity: usize) -> Self {
        let capacity = if capacity < MIN_CAPACITY { MIN_CAPACITY } else { capacity };
        Self {
            capacity,
            high: capacity + capacity / 10,
            low: capacity - capacity / 3,
        }
    }

    /// Returns the nominal capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the strong-tier size at which a sweep runs.
    #[must_use]
    pub const fn high(&self) -> usize {
        self.high
    }

    /// Returns the strong-tier size a sweep shrinks towards.
    #[must_use]
    pub const fn low(&self) -> usize {
        self.low
    }

    /// Returns how many strong entries a sweep must demote before admitting one more entry into
    /// a strong tier of `strong_len` entries, or `None` when no sweep is needed.
    #[must_use]
    pub const fn demotions_needed(&self, strong_len: usize) -> Option<usize> {
        let current = strong_len + 1;
        if current < self.high {
            None
        } else {
            Some(current - self.low)
        }
    }
}

/// Keeps the `limit` lightest candidates offered to it.
///
/// Backed by a max-heap on weight so the heaviest retained candidate is the one displaced. On
/// equal weights the candidate offered first is kept.
pub(crate) struct LightestSet<T> {
    heap: BinaryHeap<Candidate<T>>,
    limit: usize,
}

impl<T> LightestSet<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(limit),
            limit,
        }
    }

    /// Offers a candidate with its (already decayed) weight.
    pub(crate) fn offer(&mut self, weight: u32, item: T) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() < self.limit {
            self.heap.push(Candidate { weight, item });
            return;
        }
        if let Some(mut heaviest) = self.heap.peek_mut()
            && weight < heaviest.weight
        {
            *heaviest = Candidate { weight, item };
        }
    }

    pub(crate) fn into_items(self) -> impl Iterator<Item = T> {
        self.heap.into_iter().map(|candidate| candidate.item)
    }
}

struct Candidate<T> {
    weight: u32,
    item: T,
}

impl<T> PartialEq for Candidate<T> {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight
    }
}

impl<T> Eq for Candidate<T> {}

impl<T> PartialOrd for Candidate<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Candidate<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight.cmp(&other.weight)
    }
}
