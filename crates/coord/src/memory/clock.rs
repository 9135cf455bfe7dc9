use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use sentinel_common::ids::WorkerId;

/// Causal relation between two vector clocks.
///
/// `Concurrent` is the only case that triggers conflict resolution; two
/// identical clocks also compare as concurrent (neither strictly precedes
/// the other), which resolvers must handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Concurrent,
}

/// Per-worker monotonic counter map summarizing write causality.
///
/// All operations are local and synchronous.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<WorkerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: WorkerId) -> u64 {
        self.counters.get(&id).copied().unwrap_or(0)
    }

    /// Bump the local worker's counter.
    pub fn increment(&mut self, local: WorkerId) {
        *self.counters.entry(local).or_insert(0) += 1;
    }

    /// Element-wise maximum with another clock, without advancing the local
    /// counter. Used when observing remote entries on read.
    pub fn observe(&mut self, other: &VectorClock) {
        for (id, &count) in &other.counters {
            let entry = self.counters.entry(*id).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Element-wise maximum with another clock, then increment the local
    /// counter. Used when producing a write that causally follows `other`.
    pub fn merge(&mut self, other: &VectorClock, local: WorkerId) {
        self.observe(other);
        self.increment(local);
    }

    /// Causal comparison. `Before` iff every component of `self` is <= the
    /// corresponding component of `other` and at least one is strictly
    /// less; `After` symmetrically; `Concurrent` otherwise.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_le = true;
        let mut other_le = true;

        for id in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(*id);
            let b = other.get(*id);
            if a > b {
                self_le = false;
            }
            if b > a {
                other_le = false;
            }
        }

        match (self_le, other_le) {
            // Equal clocks: neither strictly precedes the other.
            (true, true) => ClockOrdering::Concurrent,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// Whether `self` strictly dominates `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(WorkerId, u64)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (id, n) in pairs {
            for _ in 0..*n {
                c.increment(*id);
            }
        }
        c
    }

    #[test]
    fn test_increment_is_monotonic() {
        let w = WorkerId::new();
        let mut c = VectorClock::new();

        let mut prev = c.clone();
        for _ in 0..5 {
            c.increment(w);
            assert!(c.dominates(&prev));
            prev = c.clone();
        }
    }

    #[test]
    fn test_before_after() {
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        let a = clock(&[(w1, 1)]);
        let b = clock(&[(w1, 2), (w2, 1)]);

        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn test_concurrent_and_equal() {
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        let a = clock(&[(w1, 1)]);
        let b = clock(&[(w2, 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);

        // Identical clocks are concurrent: neither strictly precedes.
        assert_eq!(a.compare(&a.clone()), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_merge_takes_maximum_and_advances_local() {
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        let mut a = clock(&[(w1, 1)]);
        let b = clock(&[(w1, 3), (w2, 2)]);

        a.merge(&b, w1);
        assert_eq!(a.get(w1), 4);
        assert_eq!(a.get(w2), 2);
        assert!(a.dominates(&b));
    }

    #[test]
    fn test_observe_does_not_advance_local() {
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        let mut a = clock(&[(w1, 2)]);
        let b = clock(&[(w2, 5)]);

        a.observe(&b);
        assert_eq!(a.get(w1), 2);
        assert_eq!(a.get(w2), 5);
    }
}
