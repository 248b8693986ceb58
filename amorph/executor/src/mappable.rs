// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Splittable collections for [`crate::Runtime::forall`].

use std::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A fixed collection whose items can be handed out by index. Workers of a `forall` claim
/// disjoint chunks of indices, so every item is mapped exactly once.
pub trait Mappable: Sync {
    type Item;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item at `index`, for `index < len()`.
    fn item(&self, index: usize) -> Self::Item;

    /// Number of consecutive indices a worker claims at once. `None` lets the executor pick.
    fn chunk_size(&self) -> Option<usize> {
        None
    }
}

/// The integers of `range`.
#[derive(Clone, Debug)]
pub struct RangeMapper {
    range: Range<usize>,
    chunk_size: Option<usize>,
}

impl RangeMapper {
    pub fn new(range: Range<usize>) -> Self {
        Self {
            range,
            chunk_size: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }
}

impl Mappable for RangeMapper {
    type Item = usize;

    fn len(&self) -> usize {
        self.range.len()
    }

    fn item(&self, index: usize) -> usize {
        self.range.start + index
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }
}

/// Clones of the items of a vector.
#[derive(Clone, Debug)]
pub struct ListMapper<T> {
    items: Vec<T>,
    chunk_size: Option<usize>,
}

impl<T> ListMapper<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            chunk_size: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

impl<T> Mappable for ListMapper<T>
where
    T: Clone + Sync,
{
    type Item = T;

    fn len(&self) -> usize {
        self.items.len()
    }

    fn item(&self, index: usize) -> T {
        self.items[index].clone()
    }

    fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }
}

/// Shared position of the workers in `0..len`.
pub(crate) struct ChunkCursor {
    next: AtomicUsize,
    len: usize,
    chunk_size: usize,
}

impl ChunkCursor {
    pub(crate) fn new(len: usize, chunk_size: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            len,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Claims the next chunk of indices, `None` once every index was handed out.
    pub(crate) fn next_chunk(&self) -> Option<Range<usize>> {
        // Bounded by len plus one chunk per worker, far from overflowing.
        let start = self.next.fetch_add(self.chunk_size, Ordering::Relaxed);
        (start < self.len).then(|| start..self.len.min(start + self.chunk_size))
    }
}
