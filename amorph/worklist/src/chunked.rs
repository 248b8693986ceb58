// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Chunked worklists: every thread fills a private chunk and publishes it to a shared pool once
//! it holds `chunk_size` items. Threads drain whole chunks taken from the pool before falling
//! back to their own unpublished chunk, so items added by other threads only become visible to
//! `poll` after publication. `polls` scans every buffer.

use crate::{Rejected, ThreadCtx, Worklist};
use crossbeam::{queue::SegQueue, utils::CachePadded};
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

pub const DEFAULT_CHUNK_SIZE: usize = 32;

struct FifoChunks<T> {
    // Chunk taken from the pool that is being drained.
    current: Option<VecDeque<T>>,
    // Chunk being filled by this thread.
    next: VecDeque<T>,
}

/// Chunks are handed out in publication order and drained front to back.
pub struct ChunkedFifo<T> {
    chunk_size: usize,
    local: Vec<CachePadded<Mutex<FifoChunks<T>>>>,
    pool: SegQueue<VecDeque<T>>,
    size: AtomicUsize,
}

impl<T> ChunkedFifo<T> {
    pub fn new(num_threads: usize) -> Self {
        Self::with_chunk_size(num_threads, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(num_threads: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "[Amorph]: chunk size must be positive");
        Self {
            chunk_size,
            local: (0..num_threads.max(1))
                .map(|_| {
                    CachePadded::new(Mutex::new(FifoChunks {
                        current: None,
                        next: VecDeque::with_capacity(chunk_size),
                    }))
                })
                .collect(),
            pool: SegQueue::new(),
            size: AtomicUsize::new(0),
        }
    }

    fn local(&self, ctx: ThreadCtx) -> &Mutex<FifoChunks<T>> {
        &self.local[ctx.thread_id() % self.local.len()]
    }

    fn poll_chunks(&self, chunks: &mut FifoChunks<T>) -> Option<T> {
        if chunks.current.is_none() {
            chunks.current = self.pool.pop();
        }
        while let Some(current) = chunks.current.as_mut() {
            if let Some(item) = current.pop_front() {
                return Some(item);
            }
            chunks.current = self.pool.pop();
        }
        chunks.next.pop_front()
    }

    fn taken(&self, item: Option<T>) -> Option<T> {
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

impl<T: Send> Worklist<T> for ChunkedFifo<T> {
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        let mut chunks = self.local(ctx).lock();
        if chunks.next.len() >= self.chunk_size {
            let full = std::mem::replace(
                &mut chunks.next,
                VecDeque::with_capacity(self.chunk_size),
            );
            self.pool.push(full);
        }
        chunks.next.push_back(item);
        self.size.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        let mut chunks = self.local(ctx).lock();
        let item = self.poll_chunks(&mut chunks);
        self.taken(item)
    }

    fn polls(&self) -> Option<T> {
        for local in &self.local {
            let mut chunks = local.lock();
            if let Some(item) = self.poll_chunks(&mut chunks) {
                return self.taken(Some(item));
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

/// Per-thread stacks; full stacks are pushed to a shared stack of chunks and the most recently
/// published chunk is reused first.
pub struct ChunkedLifo<T> {
    chunk_size: usize,
    local: Vec<CachePadded<Mutex<Vec<T>>>>,
    pool: Mutex<Vec<Vec<T>>>,
    size: AtomicUsize,
}

impl<T> ChunkedLifo<T> {
    pub fn new(num_threads: usize) -> Self {
        Self::with_chunk_size(num_threads, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(num_threads: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "[Amorph]: chunk size must be positive");
        Self {
            chunk_size,
            local: (0..num_threads.max(1))
                .map(|_| CachePadded::new(Mutex::new(Vec::with_capacity(chunk_size))))
                .collect(),
            pool: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
        }
    }

    fn local(&self, ctx: ThreadCtx) -> &Mutex<Vec<T>> {
        &self.local[ctx.thread_id() % self.local.len()]
    }

    fn poll_stack(&self, stack: &mut Vec<T>) -> Option<T> {
        if stack.is_empty() {
            if let Some(chunk) = self.pool.lock().pop() {
                *stack = chunk;
            }
        }
        let item = stack.pop();
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

impl<T: Send> Worklist<T> for ChunkedLifo<T> {
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        let mut stack = self.local(ctx).lock();
        if stack.len() >= self.chunk_size {
            let full = std::mem::replace(&mut *stack, Vec::with_capacity(self.chunk_size));
            self.pool.lock().push(full);
        }
        stack.push(item);
        self.size.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        let mut stack = self.local(ctx).lock();
        self.poll_stack(&mut stack)
    }

    fn polls(&self) -> Option<T> {
        for local in &self.local {
            if let Some(item) = self.poll_stack(&mut local.lock()) {
                return Some(item);
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

/// Each thread works LIFO on a small private chunk. When the chunk overflows its items are
/// spilled into a shared bag, and an empty chunk is refilled with items drawn from the bag at
/// random, which decorrelates the processing order from the insertion order.
pub struct ChunkedRandomOrder<T> {
    chunk_size: usize,
    local: Vec<CachePadded<Mutex<Vec<T>>>>,
    bag: Mutex<Vec<T>>,
    size: AtomicUsize,
}

impl<T> ChunkedRandomOrder<T> {
    pub fn new(num_threads: usize) -> Self {
        Self::with_chunk_size(num_threads, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(num_threads: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "[Amorph]: chunk size must be positive");
        Self {
            chunk_size,
            local: (0..num_threads.max(1))
                .map(|_| CachePadded::new(Mutex::new(Vec::with_capacity(chunk_size))))
                .collect(),
            bag: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
        }
    }

    fn local(&self, ctx: ThreadCtx) -> &Mutex<Vec<T>> {
        &self.local[ctx.thread_id() % self.local.len()]
    }

    fn poll_chunk(&self, chunk: &mut Vec<T>) -> Option<T> {
        let mut item = chunk.pop();
        if item.is_none() {
            let mut bag = self.bag.lock();
            let mut rng = rand::thread_rng();
            // One item to return plus a full chunk for later polls.
            for _ in 0..=self.chunk_size {
                if bag.is_empty() {
                    break;
                }
                let pick = rng.gen_range(0, bag.len());
                let drawn = bag.swap_remove(pick);
                if item.is_none() {
                    item = Some(drawn);
                } else {
                    chunk.push(drawn);
                }
            }
        }
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

impl<T: Send> Worklist<T> for ChunkedRandomOrder<T> {
    fn add(&self, item: T, ctx: ThreadCtx) -> Result<(), Rejected<T>> {
        let mut chunk = self.local(ctx).lock();
        if chunk.len() >= self.chunk_size {
            self.bag.lock().append(&mut chunk);
        }
        chunk.push(item);
        self.size.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<T> {
        let mut chunk = self.local(ctx).lock();
        self.poll_chunk(&mut chunk)
    }

    fn polls(&self) -> Option<T> {
        for local in &self.local {
            if let Some(item) = self.poll_chunk(&mut local.lock()) {
                return Some(item);
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}
