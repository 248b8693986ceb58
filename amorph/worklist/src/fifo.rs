// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{Rejected, ThreadCtx, Worklist};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Unbounded first-in first-out worklist.
pub struct Fifo<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Worklist<T> for Fifo<T> {
    fn add(&self, item: T, _ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.queue.lock().push_back(item);
        Ok(())
    }

    fn poll(&self, _ctx: ThreadCtx) -> Option<T> {
        self.queue.lock().pop_front()
    }

    fn polls(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Unbounded last-in first-out worklist.
pub struct Lifo<T> {
    stack: Mutex<Vec<T>>,
}

impl<T> Lifo<T> {
    pub fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Default for Lifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Worklist<T> for Lifo<T> {
    fn add(&self, item: T, _ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.stack.lock().push(item);
        Ok(())
    }

    fn poll(&self, _ctx: ThreadCtx) -> Option<T> {
        self.stack.lock().pop()
    }

    fn polls(&self) -> Option<T> {
        self.stack.lock().pop()
    }

    fn size(&self) -> usize {
        self.stack.lock().len()
    }
}

/// First-in first-out ring with a fixed capacity. Adding to a full ring hands the item back.
pub struct BoundedFifo<T> {
    ring: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedFifo<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "[Amorph]: bounded worklist needs a positive capacity");
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().len() >= self.capacity
    }
}

impl<T: Send> Worklist<T> for BoundedFifo<T> {
    fn add(&self, item: T, _ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            return Err(Rejected(item));
        }
        ring.push_back(item);
        Ok(())
    }

    fn poll(&self, _ctx: ThreadCtx) -> Option<T> {
        self.ring.lock().pop_front()
    }

    fn polls(&self) -> Option<T> {
        self.ring.lock().pop_front()
    }

    fn size(&self) -> usize {
        self.ring.lock().len()
    }
}

/// Last-in first-out stack with a fixed capacity.
pub struct BoundedLifo<T> {
    stack: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> BoundedLifo<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "[Amorph]: bounded worklist needs a positive capacity");
        Self {
            stack: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Send> Worklist<T> for BoundedLifo<T> {
    fn add(&self, item: T, _ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        let mut stack = self.stack.lock();
        if stack.len() >= self.capacity {
            return Err(Rejected(item));
        }
        stack.push(item);
        Ok(())
    }

    fn poll(&self, _ctx: ThreadCtx) -> Option<T> {
        self.stack.lock().pop()
    }

    fn polls(&self) -> Option<T> {
        self.stack.lock().pop()
    }

    fn size(&self) -> usize {
        self.stack.lock().len()
    }
}

/// Lock-free bounded FIFO on top of [`ArrayQueue`].
pub struct ConcurrentBoundedFifo<T> {
    queue: ArrayQueue<T>,
}

impl<T> ConcurrentBoundedFifo<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<T: Send> Worklist<T> for ConcurrentBoundedFifo<T> {
    fn add(&self, item: T, _ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.queue.push(item).map_err(Rejected)
    }

    fn poll(&self, _ctx: ThreadCtx) -> Option<T> {
        self.queue.pop()
    }

    fn polls(&self) -> Option<T> {
        self.queue.pop()
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
