// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Worklists that feed the speculative executors in `amorph-executor`.
//!
//! A worklist is an unordered (or priority ordered) container of pending work items. Every
//! method takes `&self` so that a single instance can be shared by all worker threads; each
//! policy chooses its own synchronization (a mutex, a lock-free queue, or per-thread buffers
//! indexed by [`ThreadCtx::thread_id`]).
//!
//! The contract every policy satisfies:
//! - every item passed to `add` or `add_aborted` is eventually returned by exactly one `poll`
//!   or `polls` call, unless the worklist is dropped first;
//! - `polls` may only be called while no other thread touches the worklist, and returns an item
//!   whenever the worklist is non-empty;
//! - `size` is exact while the worklist is quiescent and a best-effort value otherwise.

mod chunked;
mod fifo;
mod metric;
mod ordered;
mod work_stealing;


pub use chunked::{ChunkedFifo, ChunkedLifo, ChunkedRandomOrder, DEFAULT_CHUNK_SIZE};
pub use fifo::{BoundedFifo, BoundedLifo, ConcurrentBoundedFifo, Fifo, Lifo};
pub use metric::{
    Indexer, OrderedByFloatMetric, OrderedByIntegerMetric, RelaxedOrderedByIntegerMetric,
    APPROX_RANGE,
};
pub use ordered::{Ordered, PriorityQueue};
pub use work_stealing::WorkStealing;

use std::{cmp::Ordering, fmt, sync::Arc};

/// Total order used by ordered worklists and ordered executors. `Less` means higher priority.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Builds a [`Comparator`] from the natural order of `T`.
pub fn natural_order<T: Ord + 'static>() -> Comparator<T> {
    Arc::new(|a: &T, b: &T| a.cmp(b))
}

/// Identifies the worker thread calling into a worklist. Per-thread policies use the id to pick
/// their local buffers; ids beyond the configured thread count wrap around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ThreadCtx {
    thread_id: usize,
}

impl ThreadCtx {
    pub fn new(thread_id: usize) -> Self {
        Self { thread_id }
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }
}

/// An item the worklist refused to take. Ownership of the item goes back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejected<T>(pub T);

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worklist rejected an item")
    }
}

impl<T: fmt::Debug> std::error::Error for Rejected<T> {}

pub trait Worklist<T>: Send + Sync {
    /// Adds an item. Bounded policies return the item back when they are full.
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>>;

    /// Re-inserts the item of an aborted iteration. A policy may reject the item under
    /// contention, in which case the executor retries until the item is accepted.
    fn add_aborted(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.add(item, ctx)
    }

    /// Removes some item, or returns `None` if none could be found for this thread.
    fn poll(&self, ctx: ThreadCtx) -> Option<T>;

    /// Serial poll: only valid while no other thread uses the worklist. Finds an item if one
    /// exists anywhere in the worklist.
    fn polls(&self) -> Option<T>;

    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// A worklist whose `poll` returns a minimal item under [`OrderedWorklist::comparator`].
pub trait OrderedWorklist<T>: Worklist<T> {
    /// Returns a copy of the item the next `poll` would return.
    fn peek(&self) -> Option<T>;

    fn comparator(&self) -> &Comparator<T>;
}

impl<T, W: Worklist<T> + ?Sized> Worklist<T> for Arc<W> {
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        (**self).add(item, ctx)
    }

    fn add_aborted(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        (**self).add_aborted(item, ctx)
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        (**self).poll(ctx)
    }

    fn polls(&self) -> Option<T> {
        (**self).polls()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

impl<T, W: OrderedWorklist<T> + ?Sized> OrderedWorklist<T> for Arc<W> {
    fn peek(&self) -> Option<T> {
        (**self).peek()
    }

    fn comparator(&self) -> &Comparator<T> {
        (**self).comparator()
    }
}

/// Seeds a worklist with the initial items, spreading them over `num_threads` per-thread
/// buffers in round-robin order.
pub fn initial_work_distribution<T, W, I>(
    worklist: &W,
    initial: I,
    num_threads: usize,
) -> Result<(), Rejected<T>>
where
    W: Worklist<T> + ?Sized,
    I: IntoIterator<Item = T>,
{
    let num_threads = num_threads.max(1);
    for (idx, item) in initial.into_iter().enumerate() {
        worklist.add(item, ThreadCtx::new(idx % num_threads))?;
    }
    Ok(())
}
