// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::iteration::IterationId;
use amorph_worklist::{Comparator, PriorityQueue};
use std::sync::Arc;

pub(crate) struct RobEntry<T> {
    pub(crate) item: Arc<T>,
    pub(crate) id: IterationId,
}

/// Scheduled iterations in priority order of their items, ties broken by iteration id. The
/// head is the only entry allowed to commit.
pub(crate) struct ReorderBuffer<T> {
    queue: PriorityQueue<RobEntry<T>>,
}

impl<T: 'static> ReorderBuffer<T> {
    pub(crate) fn new(comparator: Comparator<T>) -> Self {
        let by_item_then_id = move |a: &RobEntry<T>, b: &RobEntry<T>| {
            comparator(&*a.item, &*b.item).then(a.id.cmp(&b.id))
        };
        Self {
            queue: PriorityQueue::new(Arc::new(by_item_then_id)),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub(crate) fn push(&mut self, item: Arc<T>, id: IterationId) {
        self.queue.push(RobEntry { item, id });
    }

    pub(crate) fn head(&self) -> Option<(IterationId, Arc<T>)> {
        self.queue
            .peek()
            .map(|entry| (entry.id, entry.item.clone()))
    }

    pub(crate) fn pop(&mut self) -> Option<RobEntry<T>> {
        self.queue.pop()
    }

    pub(crate) fn remove_first<P>(&mut self, pred: P) -> Option<RobEntry<T>>
    where
        P: FnMut(&RobEntry<T>) -> bool,
    {
        self.queue.remove_first(pred)
    }

    pub(crate) fn drain(&mut self) -> Vec<RobEntry<T>> {
        self.queue.drain_sorted()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RobEntry<T>> {
        self.queue.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}
