// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded min-heap of Top-K candidates with a key → position index.
//!
//! The index makes "update the count of a key already in the heap" an
//! O(log K) sift instead of a linear search.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: String,
    pub count: u32,
}

#[derive(Debug, Default)]
pub struct IndexedMinHeap {
    entries: Vec<Candidate>,
    positions: HashMap<String, usize>,
}

impl IndexedMinHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    /// Smallest candidate (next to be evicted).
    #[must_use]
    pub fn peek_min(&self) -> Option<&Candidate> {
        self.entries.first()
    }

    /// Set the count of an existing key. Returns false if the key is absent.
    pub fn update(&mut self, key: &str, count: u32) -> bool {
        let Some(&pos) = self.positions.get(key) else {
            return false;
        };
        let old = self.entries[pos].count;
        self.entries[pos].count = count;
        if count < old {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
        true
    }

    /// Insert a key that is not yet present.
    pub fn push(&mut self, candidate: Candidate) {
        debug_assert!(!self.contains(&candidate.key));
        let pos = self.entries.len();
        self.positions.insert(candidate.key.clone(), pos);
        self.entries.push(candidate);
        self.sift_up(pos);
    }

    pub fn pop_min(&mut self) -> Option<Candidate> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(0, last);
        let min = self.entries.pop()?;
        self.positions.remove(&min.key);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(min)
    }

    /// Halve every count. Halving is monotone, so heap order is preserved.
    pub fn halve_all(&mut self) {
        for entry in &mut self.entries {
            entry.count >>= 1;
        }
    }

    /// All candidates, highest count first. Ties are ordered by key.
    #[must_use]
    pub fn sorted_desc(&self) -> Vec<(String, u32)> {
        let mut out: Vec<(String, u32)> = self
            .entries
            .iter()
            .map(|c| (c.key.clone(), c.count))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].key.clone(), a);
        self.positions.insert(self.entries[b].key.clone(), b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].count >= self.entries[parent].count {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.entries[left].count < self.entries[smallest].count {
                smallest = left;
            }
            if right < len && self.entries[right].count < self.entries[smallest].count {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(key: &str, count: u32) -> Candidate {
        Candidate { key: key.to_string(), count }
    }

    fn assert_heap(heap: &IndexedMinHeap) {
        for (i, entry) in heap.entries.iter().enumerate() {
            assert_eq!(heap.positions[&entry.key], i);
            if i > 0 {
                assert!(heap.entries[(i - 1) / 2].count <= entry.count);
            }
        }
        assert_eq!(heap.positions.len(), heap.entries.len());
    }

    #[test]
    fn test_pop_in_ascending_order() {
        let mut heap = IndexedMinHeap::with_capacity(8);
        for (k, c) in [("a", 5), ("b", 1), ("c", 9), ("d", 3), ("e", 7)] {
            heap.push(cand(k, c));
            assert_heap(&heap);
        }
        let popped: Vec<u32> = std::iter::from_fn(|| heap.pop_min().map(|c| c.count)).collect();
        assert_eq!(popped, vec![1, 3, 5, 7, 9]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_update_moves_both_ways() {
        let mut heap = IndexedMinHeap::with_capacity(8);
        for (k, c) in [("a", 5), ("b", 1), ("c", 9), ("d", 3)] {
            heap.push(cand(k, c));
        }
        assert!(heap.update("c", 0));
        assert_heap(&heap);
        assert_eq!(heap.peek_min().unwrap().key, "c");

        assert!(heap.update("c", 100));
        assert_heap(&heap);
        assert_eq!(heap.peek_min().unwrap().key, "b");

        assert!(!heap.update("zz", 1));
    }

    #[test]
    fn test_sorted_desc_and_halve() {
        let mut heap = IndexedMinHeap::with_capacity(4);
        heap.push(cand("x", 10));
        heap.push(cand("y", 21));
        heap.push(cand("z", 4));
        heap.halve_all();
        assert_heap(&heap);
        assert_eq!(
            heap.sorted_desc(),
            vec![("y".to_string(), 10), ("x".to_string(), 5), ("z".to_string(), 2)]
        );
    }
}
