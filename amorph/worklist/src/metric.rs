// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{Fifo, Rejected, ThreadCtx, Worklist};
use crossbeam::utils::CachePadded;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Number of buckets of the relaxed metric worklist. Metrics are folded modulo this range.
pub const APPROX_RANGE: usize = 2048;

/// Maps an item to its bucket. Smaller values are polled first unless the worklist is
/// descending.
pub type Indexer<T> = Arc<dyn Fn(&T) -> usize + Send + Sync>;

/// Soft priority worklist: items are kept in buckets indexed by an integer metric, each bucket
/// being a sub-worklist built by a maker closure. Every thread polls from its own cursor, which
/// moves towards lower priority buckets as they drain and is pulled back when an item with a
/// higher priority is added.
pub struct OrderedByIntegerMetric<T, W = Fifo<T>> {
    indexer: Indexer<T>,
    buckets: Vec<W>,
    descending: bool,
    approximate: bool,
    cursors: Vec<CachePadded<AtomicUsize>>,
    size: AtomicUsize,
}

impl<T: Send> OrderedByIntegerMetric<T, Fifo<T>> {
    /// Worklist for metrics in `0..=range`, polled in ascending order.
    pub fn new<F>(range: usize, num_threads: usize, indexer: F) -> Self
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
    {
        Self::with_buckets(range, num_threads, false, indexer, Fifo::new)
    }

    /// Worklist for metrics in `0..=range`, polled in descending order.
    pub fn descending<F>(range: usize, num_threads: usize, indexer: F) -> Self
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
    {
        Self::with_buckets(range, num_threads, true, indexer, Fifo::new)
    }
}

impl<T, W> OrderedByIntegerMetric<T, W>
where
    T: Send,
    W: Worklist<T>,
{
    pub fn with_buckets<F, M>(
        range: usize,
        num_threads: usize,
        descending: bool,
        indexer: F,
        maker: M,
    ) -> Self
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
        M: FnMut() -> W,
    {
        Self::build(range + 1, num_threads, descending, false, Arc::new(indexer), maker)
    }

    fn build<M>(
        num_buckets: usize,
        num_threads: usize,
        descending: bool,
        approximate: bool,
        indexer: Indexer<T>,
        maker: M,
    ) -> Self
    where
        M: FnMut() -> W,
    {
        let start = if descending { num_buckets - 1 } else { 0 };
        Self {
            indexer,
            buckets: std::iter::repeat_with(maker).take(num_buckets).collect(),
            descending,
            approximate,
            cursors: (0..num_threads.max(1))
                .map(|_| CachePadded::new(AtomicUsize::new(start)))
                .collect(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn start(&self) -> usize {
        if self.descending {
            self.buckets.len() - 1
        } else {
            0
        }
    }

    fn cursor(&self, ctx: ThreadCtx) -> &AtomicUsize {
        &self.cursors[ctx.thread_id() % self.cursors.len()]
    }

    fn step(&self, index: usize) -> Option<usize> {
        if self.descending {
            index.checked_sub(1)
        } else if index + 1 < self.buckets.len() {
            Some(index + 1)
        } else {
            None
        }
    }

    fn poll_exact(&self, ctx: ThreadCtx) -> Option<T> {
        let cursor = self.cursor(ctx);
        let mut index = Some(cursor.load(Ordering::Relaxed).min(self.buckets.len() - 1));
        while let Some(idx) = index {
            if let Some(item) = self.buckets[idx].poll(ctx) {
                cursor.store(idx, Ordering::Relaxed);
                return Some(item);
            }
            index = self.step(idx);
        }
        // Rescan from the highest priority bucket next time.
        cursor.store(self.start(), Ordering::Relaxed);
        None
    }

    fn poll_approximate(&self, ctx: ThreadCtx) -> Option<T> {
        let cursor = self.cursor(ctx);
        let len = self.buckets.len();
        let mut index = cursor.load(Ordering::Relaxed) % len;
        for _ in 0..len {
            if let Some(item) = self.buckets[index].poll(ctx) {
                cursor.store(index, Ordering::Relaxed);
                return Some(item);
            }
            index = if self.descending {
                (index + len - 1) % len
            } else {
                (index + 1) % len
            };
        }
        None
    }
}

impl<T, W> Worklist<T> for OrderedByIntegerMetric<T, W>
where
    T: Send,
    W: Worklist<T>,
{
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        let mut index = (self.indexer)(&item);
        if self.approximate {
            index %= self.buckets.len();
        } else if index >= self.buckets.len() {
            return Err(Rejected(item));
        }
        self.size.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = self.buckets[index].add(item, ctx) {
            self.size.fetch_sub(1, Ordering::SeqCst);
            return Err(rejected);
        }
        if !self.approximate {
            for cursor in &self.cursors {
                if self.descending {
                    cursor.fetch_max(index, Ordering::Relaxed);
                } else {
                    cursor.fetch_min(index, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        let item = if self.approximate {
            self.poll_approximate(ctx)
        } else {
            self.poll_exact(ctx)
        };
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    fn polls(&self) -> Option<T> {
        let mut index = Some(self.start());
        while let Some(idx) = index {
            if let Some(item) = self.buckets[idx].polls() {
                self.size.fetch_sub(1, Ordering::SeqCst);
                for cursor in &self.cursors {
                    cursor.store(idx, Ordering::Relaxed);
                }
                return Some(item);
            }
            index = self.step(idx);
        }
        None
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

/// Relaxed variant of [`OrderedByIntegerMetric`] for unbounded metrics that grow roughly
/// monotonically (for example distances in a wavefront). Metrics are folded into
/// [`APPROX_RANGE`] buckets and cursors only move forward, wrapping around the end, so `poll`
/// may return an item of lower priority while a higher priority one is present.
pub struct RelaxedOrderedByIntegerMetric<T, W = Fifo<T>> {
    inner: OrderedByIntegerMetric<T, W>,
}

impl<T: Send> RelaxedOrderedByIntegerMetric<T, Fifo<T>> {
    pub fn new<F>(num_threads: usize, descending: bool, indexer: F) -> Self
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
    {
        Self::with_buckets(num_threads, descending, indexer, Fifo::new)
    }
}

impl<T, W> RelaxedOrderedByIntegerMetric<T, W>
where
    T: Send,
    W: Worklist<T>,
{
    pub fn with_buckets<F, M>(num_threads: usize, descending: bool, indexer: F, maker: M) -> Self
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
        M: FnMut() -> W,
    {
        Self {
            inner: OrderedByIntegerMetric::build(
                APPROX_RANGE,
                num_threads,
                descending,
                true,
                Arc::new(indexer),
                maker,
            ),
        }
    }
}

impl<T, W> Worklist<T> for RelaxedOrderedByIntegerMetric<T, W>
where
    T: Send,
    W: Worklist<T>,
{
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.inner.add(item, ctx)
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        self.inner.poll(ctx)
    }

    fn polls(&self) -> Option<T> {
        self.inner.polls()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

/// Bucketed worklist for a floating point metric in `[min, max]`. Values outside the interval
/// land in the first or last bucket, NaN in the last one.
pub struct OrderedByFloatMetric<T, W = Fifo<T>> {
    inner: OrderedByIntegerMetric<T, W>,
}

impl<T: Send> OrderedByFloatMetric<T, Fifo<T>> {
    pub fn new<F>(num_buckets: usize, min: f64, max: f64, num_threads: usize, metric: F) -> Self
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        Self::with_buckets(num_buckets, min, max, num_threads, false, metric, Fifo::new)
    }
}

impl<T, W> OrderedByFloatMetric<T, W>
where
    T: Send,
    W: Worklist<T>,
{
    pub fn with_buckets<F, M>(
        num_buckets: usize,
        min: f64,
        max: f64,
        num_threads: usize,
        descending: bool,
        metric: F,
        maker: M,
    ) -> Self
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
        M: FnMut() -> W,
    {
        assert!(num_buckets > 0, "[Amorph]: float metric needs at least one bucket");
        assert!(min < max, "[Amorph]: float metric needs min < max");
        let last = num_buckets - 1;
        let scale = last as f64 / (max - min);
        let indexer = move |item: &T| {
            let value = metric(item);
            if value.is_nan() {
                last
            } else {
                (((value - min) * scale).max(0.0) as usize).min(last)
            }
        };
        Self {
            inner: OrderedByIntegerMetric::with_buckets(
                last,
                num_threads,
                descending,
                indexer,
                maker,
            ),
        }
    }
}

impl<T, W> Worklist<T> for OrderedByFloatMetric<T, W>
where
    T: Send,
    W: Worklist<T>,
{
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        self.inner.add(item, ctx)
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        self.inner.poll(ctx)
    }

    fn polls(&self) -> Option<T> {
        self.inner.polls()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}
