//! Worker ring buffer (§3, §4.4): a fixed-capacity store of the most
//! recent `T` per-worker frame slices, indexed by slot with a separate
//! counter→slot map since counters are not contiguous once round-robin
//! mode reorders arrivals.

use std::collections::HashMap;

/// Fixed-capacity ring of `m_w`-wide float32 rows, each tagged by its
/// counter. Overwrites the oldest row when full.
pub struct RingBuffer {
    capacity: usize,
    row_len: usize,
    rows: Vec<Vec<f32>>,
    /// Counter stored at each slot, or `None` if the slot has never been
    /// written (only possible before the ring first fills).
    slot_counter: Vec<Option<i64>>,
    counter_to_slot: HashMap<i64, usize>,
    head: usize,
    len: usize,
    max_stored_time: Option<i64>,
}

/// Counter and slot index of the row a new insert evicted, if any.
pub struct Eviction {
    pub counter: i64,
    pub slot: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize, row_len: usize) -> Self {
        Self {
            capacity,
            row_len,
            rows: vec![vec![0.0; row_len]; capacity],
            slot_counter: vec![None; capacity],
            counter_to_slot: HashMap::with_capacity(capacity),
            head: 0,
            len: 0,
            max_stored_time: None,
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn is_full(&self) -> bool { self.len == self.capacity }

    /// Maximum counter currently present, or `None` if the ring is empty.
    pub fn max_stored_time(&self) -> Option<i64> { self.max_stored_time }

    /// `tm -> idx`: the slot a counter is stored at, or `None` if absent.
    /// O(1) amortized via the `counter_to_slot` map.
    pub fn slot_of(&self, counter: i64) -> Option<usize> {
        self.counter_to_slot.get(&counter).copied()
    }

    pub fn row(&self, slot: usize) -> &[f32] { &self.rows[slot] }

    /// Which eviction (if any) `insert` for this counter would perform,
    /// without performing it — callers that need to run
    /// `workerBeforeDataRemove` before the overwrite call this first.
    pub fn pending_eviction(&self) -> Option<Eviction> {
        if self.len < self.capacity {
            return None;
        }
        self.slot_counter[self.head].map(|counter| Eviction { counter, slot: self.head })
    }

    /// Overwrites the oldest slot (if full) with `data` tagged `counter`,
    /// returning the slot index written. Panics if `data.len() !=
    /// row_len` — a caller bug, not a data-dependent condition.
    pub fn insert(&mut self, counter: i64, data: &[f32]) -> usize {
        assert_eq!(data.len(), self.row_len, "row length mismatch on ring insert");

        let slot = self.head;
        if let Some(old_counter) = self.slot_counter[slot] {
            self.counter_to_slot.remove(&old_counter);
        } else {
            self.len += 1;
        }

        self.rows[slot].copy_from_slice(data);
        self.slot_counter[slot] = Some(counter);
        self.counter_to_slot.insert(counter, slot);

        self.head = (self.head + 1) % self.capacity;
        self.max_stored_time = Some(self.max_stored_time.map_or(counter, |m| m.max(counter)));
        slot
    }

    /// Iterates `(counter, slot)` pairs in ascending counter order — the
    /// "stored order" the at-end variant walks in workerCalc.
    pub fn iter_by_counter(&self) -> impl Iterator<Item = (i64, usize)> + '_ {
        let mut pairs: Vec<(i64, usize)> = self.counter_to_slot.iter().map(|(&c, &s)| (c, s)).collect();
        pairs.sort_unstable_by_key(|&(c, _)| c);
        pairs.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_counter_returns_none() {
        let ring = RingBuffer::new(4, 2);
        assert_eq!(ring.slot_of(42), None);
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut ring = RingBuffer::new(4, 2);
        let slot = ring.insert(10, &[1.0, 2.0]);
        assert_eq!(ring.slot_of(10), Some(slot));
        assert_eq!(ring.row(slot), &[1.0, 2.0]);
        assert_eq!(ring.max_stored_time(), Some(10));
    }

    #[test]
    fn eviction_makes_old_counter_absent() {
        let mut ring = RingBuffer::new(2, 1);
        ring.insert(1, &[1.0]);
        ring.insert(2, &[2.0]);
        assert!(ring.is_full());
        let evicted = ring.pending_eviction().unwrap();
        assert_eq!(evicted.counter, 1);
        ring.insert(3, &[3.0]);
        assert_eq!(ring.slot_of(1), None);
        assert_eq!(ring.slot_of(2), Some(1));
        assert_eq!(ring.slot_of(3), Some(0));
    }

    #[test]
    fn pending_eviction_none_while_not_full() {
        let mut ring = RingBuffer::new(3, 1);
        ring.insert(1, &[1.0]);
        assert!(ring.pending_eviction().is_none());
    }

    #[test]
    fn iter_by_counter_is_ascending() {
        let mut ring = RingBuffer::new(4, 1);
        for c in [5, 1, 3, 2] {
            ring.insert(c, &[c as f32]);
        }
        let order: Vec<i64> = ring.iter_by_counter().map(|(c, _)| c).collect();
        assert_eq!(order, vec![1, 2, 3, 5]);
    }
}
