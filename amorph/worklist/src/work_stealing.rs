// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{Rejected, ThreadCtx, Worklist};
use crossbeam::{
    deque::{Steal, Stealer, Worker},
    utils::CachePadded,
};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-thread deques with random-victim stealing. Items are added to the caller's own deque;
/// a thread whose deque is empty steals a batch from the other deques, starting at a random
/// victim.
pub struct WorkStealing<T> {
    // Only the owning thread pops from a worker in the common case; the mutex makes the
    // worklist shareable and serializes the rare foreign access from `polls`.
    workers: Vec<CachePadded<Mutex<Worker<T>>>>,
    stealers: Vec<Stealer<T>>,
    size: AtomicUsize,
}

impl<T> WorkStealing<T> {
    /// Worklist whose threads process their own items last-in first-out.
    pub fn new(num_threads: usize) -> Self {
        Self::build(num_threads, Worker::new_lifo)
    }

    /// Worklist whose threads process their own items first-in first-out.
    pub fn locally_fifo(num_threads: usize) -> Self {
        Self::build(num_threads, Worker::new_fifo)
    }

    fn build(num_threads: usize, make: fn() -> Worker<T>) -> Self {
        let (workers, stealers): (Vec<_>, Vec<_>) = (0..num_threads.max(1))
            .map(|_| {
                let worker = make();
                let stealer = worker.stealer();
                (CachePadded::new(Mutex::new(worker)), stealer)
            })
            .unzip();
        Self {
            workers,
            stealers,
            size: AtomicUsize::new(0),
        }
    }

    fn index(&self, ctx: ThreadCtx) -> usize {
        ctx.thread_id() % self.workers.len()
    }

    fn steal_into(&self, thief: usize, dest: &Worker<T>) -> Option<T> {
        let num = self.stealers.len();
        let start = rand::thread_rng().gen_range(0, num);
        for offset in 0..num {
            let victim = (start + offset) % num;
            if victim == thief {
                continue;
            }
            loop {
                match self.stealers[victim].steal_batch_and_pop(dest) {
                    Steal::Success(item) => return Some(item),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    fn taken(&self, item: Option<T>) -> Option<T> {
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

impl<T: Send> Worklist<T> for WorkStealing<T> {
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.size.fetch_add(1, Ordering::SeqCst);
        self.workers[self.index(ctx)].lock().push(item);
        Ok(())
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        let idx = self.index(ctx);
        let worker = self.workers[idx].lock();
        let item = worker.pop().or_else(|| self.steal_into(idx, &worker));
        self.taken(item)
    }

    fn polls(&self) -> Option<T> {
        for worker in &self.workers {
            if let Some(item) = worker.lock().pop() {
                return self.taken(Some(item));
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}
