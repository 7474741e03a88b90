//! Bounded recently-seen-id tracking, used to dedup direct/group/broadcast
//! message ids. Unlike a sliding-bitmap replay filter, ids here are UUIDs
//! rather than a monotonically increasing sequence, so membership is
//! tracked as a bounded FIFO set rather than a counter window.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

pub struct DedupSet {
    capacity: usize,
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `id` as seen. Returns `true` if this is the first time it has
    /// been observed (caller should process it), `false` if it is a repeat.
    pub fn record(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_accepted_repeat_is_rejected() {
        let mut set = DedupSet::new(4);
        let id = Uuid::new_v4();
        assert!(set.record(id));
        assert!(!set.record(id));
    }

    #[test]
    fn eviction_drops_oldest_once_capacity_exceeded() {
        let mut set = DedupSet::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert!(set.record(a));
        assert!(set.record(b));
        assert!(set.record(c));
        assert_eq!(set.len(), 2);
        assert!(!set.contains(&a));
        assert!(set.contains(&b));
        assert!(set.contains(&c));
    }

    #[test]
    fn evicted_id_can_be_recorded_again() {
        let mut set = DedupSet::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(set.record(a));
        assert!(set.record(b));
        assert!(set.record(a), "a was evicted so it counts as unseen again");
    }
}
