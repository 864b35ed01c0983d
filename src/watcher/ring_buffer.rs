//! Fixed-capacity circular buffer used for check history and latencies.

use std::collections::VecDeque;

/// Holds at most `capacity` elements; pushing into a full buffer evicts the
/// oldest.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Relative access: `0` is the most recent element, `-1` the one before
    /// it, and so on. Positive offsets and offsets past the oldest element
    /// yield `None`.
    #[must_use]
    pub fn get(&self, offset: isize) -> Option<&T> {
        if offset > 0 {
            return None;
        }
        let back = offset.unsigned_abs();
        let len = self.items.len();
        if back >= len {
            return None;
        }
        self.items.get(len - 1 - back)
    }

    /// The newest `n` elements, newest first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().rev().take(n)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: PartialEq> RingBuffer<T> {
    /// Whether the newest `n` elements exist and all equal `value`.
    #[must_use]
    pub fn last_n_equal(&self, n: usize, value: &T) -> bool {
        n > 0 && self.items.len() >= n && self.latest(n).all(|item| item == value)
    }
}

impl<T: Copy + Into<f64>> RingBuffer<T> {
    /// Arithmetic mean of the held elements, `None` while empty.
    #[must_use]
    pub fn average(&self) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        let sum: f64 = self.items.iter().map(|item| (*item).into()).sum();
        #[allow(clippy::cast_precision_loss)]
        Some(sum / self.items.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut ring = RingBuffer::new(3);
        for i in 1..=5_u32 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(0), Some(&5));
        assert_eq!(ring.get(-1), Some(&4));
        assert_eq!(ring.get(-2), Some(&3));
        assert_eq!(ring.get(-3), None);
    }

    #[test]
    fn positive_offsets_are_none() {
        let mut ring = RingBuffer::new(2);
        ring.push(1_u32);
        assert_eq!(ring.get(1), None);
    }

    #[test]
    fn average_of_held_elements() {
        let mut ring: RingBuffer<f64> = RingBuffer::new(4);
        assert_eq!(ring.average(), None);
        ring.push(1.0);
        ring.push(2.0);
        assert!((ring.average().unwrap() - 1.5).abs() < f64::EPSILON);
        for v in [10.0, 10.0, 10.0, 10.0] {
            ring.push(v);
        }
        assert!((ring.average().unwrap() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut ring = RingBuffer::new(0);
        ring.push(true);
        ring.push(false);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.get(0), Some(&false));
    }

    #[test]
    fn last_n_equal_requires_enough_history() {
        let mut ring = RingBuffer::new(3);
        ring.push(true);
        assert!(!ring.last_n_equal(2, &true));
        ring.push(true);
        assert!(ring.last_n_equal(2, &true));
        ring.push(false);
        assert!(!ring.last_n_equal(2, &true));
        assert!(ring.last_n_equal(1, &false));
        assert!(!ring.last_n_equal(0, &false));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn never_exceeds_capacity_and_keeps_newest(
            cap in 1_usize..16,
            values in proptest::collection::vec(any::<u32>(), 0..64),
        ) {
            let mut ring = RingBuffer::new(cap);
            for v in &values {
                ring.push(*v);
            }
            prop_assert!(ring.len() <= cap);
            let expected: Vec<u32> = values.iter().rev().take(cap).copied().collect();
            let actual: Vec<u32> = ring.latest(cap).copied().collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
