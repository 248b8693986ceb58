// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{Comparator, OrderedWorklist, Rejected, ThreadCtx, Worklist};
use parking_lot::Mutex;
use std::cmp::Ordering;

/// Binary min-heap ordered by a runtime [`Comparator`]. Items that compare equal leave the heap
/// in insertion order.
pub struct PriorityQueue<T> {
    // (item, insertion sequence number)
    entries: Vec<(T, u64)>,
    next_seq: u64,
    comparator: Comparator<T>,
}

impl<T> PriorityQueue<T> {
    pub fn new(comparator: Comparator<T>) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            comparator,
        }
    }

    pub fn comparator(&self) -> &Comparator<T> {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push((item, seq));
        self.sift_up(self.entries.len() - 1);
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.first().map(|(item, _)| item)
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let (item, _) = self.entries.pop()?;
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(item)
    }

    /// Removes and returns the first item, in heap storage order, matching the predicate.
    pub fn remove_first<P>(&mut self, mut pred: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        let pos = self.entries.iter().position(|(item, _)| pred(item))?;
        let (item, _) = self.entries.swap_remove(pos);
        if pos < self.entries.len() {
            // The moved entry may violate the heap property in either direction.
            self.sift_up(pos);
            self.sift_down(pos);
        }
        Some(item)
    }

    /// Removes every item, smallest first.
    pub fn drain_sorted(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(item, _)| item)
    }

    fn before(&self, a: usize, b: usize) -> bool {
        let (item_a, seq_a) = &self.entries[a];
        let (item_b, seq_b) = &self.entries[b];
        match (self.comparator)(item_a, item_b) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => seq_a < seq_b,
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.before(pos, parent) {
                break;
            }
            self.entries.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.before(right, left) {
                right
            } else {
                left
            };
            if !self.before(child, pos) {
                break;
            }
            self.entries.swap(pos, child);
            pos = child;
        }
    }
}

/// Exact priority worklist: `poll` always returns a minimal item under the comparator, and items
/// that compare equal are returned first-in first-out.
pub struct Ordered<T> {
    queue: Mutex<PriorityQueue<T>>,
    comparator: Comparator<T>,
}

impl<T> Ordered<T> {
    pub fn new(comparator: Comparator<T>) -> Self {
        Self {
            queue: Mutex::new(PriorityQueue::new(comparator.clone())),
            comparator,
        }
    }
}

impl<T: Ord + 'static> Ordered<T> {
    pub fn natural() -> Self {
        Self::new(crate::natural_order())
    }
}

impl<T: Send> Worklist<T> for Ordered<T> {
    fn add(&self, item: T, _ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.queue.lock().push(item);
        Ok(())
    }

    fn poll(&self, _ctx: ThreadCtx) -> Option<T> {
        self.queue.lock().pop()
    }

    fn polls(&self) -> Option<T> {
        self.queue.lock().pop()
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }
}

impl<T: Send + Clone> OrderedWorklist<T> for Ordered<T> {
    fn peek(&self) -> Option<T> {
        self.queue.lock().peek().cloned()
    }

    fn comparator(&self) -> &Comparator<T> {
        &self.comparator
    }
}
