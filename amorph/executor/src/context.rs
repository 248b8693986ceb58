// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::{IterationError, IterationResult},
    flags::MethodFlag,
    iteration::Iteration,
};
use amorph_worklist::{ThreadCtx, Worklist};
use anyhow::anyhow;

pub(crate) type Thunk = Box<dyn FnOnce() + Send>;

/// Effects of an iteration that only become visible once it commits.
pub(crate) struct IterationOutputs<T> {
    pub(crate) items: Vec<T>,
    pub(crate) finish: bool,
    pub(crate) suspend: Vec<Thunk>,
}

impl<T> Default for IterationOutputs<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            finish: false,
            suspend: Vec::new(),
        }
    }
}

impl<T> IterationOutputs<T> {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Handle given to the loop body for the current iteration.
pub struct ForeachContext<'a, T> {
    iteration: &'a Iteration,
    // `None` when new work must always wait for the commit (the committer based executor).
    worklist: Option<&'a dyn Worklist<T>>,
    thread: ThreadCtx,
    outputs: IterationOutputs<T>,
}

impl<'a, T> ForeachContext<'a, T> {
    pub(crate) fn new(
        iteration: &'a Iteration,
        worklist: Option<&'a dyn Worklist<T>>,
        thread: ThreadCtx,
    ) -> Self {
        Self {
            iteration,
            worklist,
            thread,
            outputs: IterationOutputs::default(),
        }
    }

    pub fn iteration(&self) -> &'a Iteration {
        self.iteration
    }

    pub fn thread_id(&self) -> usize {
        self.thread.thread_id()
    }

    /// Adds new work. Under speculation the item is published when the iteration commits, and
    /// dropped if it aborts.
    pub fn add(&mut self, item: T) -> IterationResult {
        self.add_with_flags(item, MethodFlag::ALL)
    }

    /// Adds new work, publishing it immediately unless `flags` (masked by the iteration)
    /// request `SAVE_UNDO`.
    pub fn add_with_flags(&mut self, item: T, flags: MethodFlag) -> IterationResult {
        let deferred = flags
            .intersection(self.iteration.mask())
            .contains(MethodFlag::SAVE_UNDO);
        match self.worklist {
            Some(worklist) if !deferred => worklist
                .add(item, self.thread)
                .map_err(|_| IterationError::User(anyhow!("worklist rejected a new item"))),
            _ => {
                self.outputs.items.push(item);
                Ok(())
            },
        }
    }

    /// Ends the whole loop once this iteration commits. In-flight iterations of lower priority
    /// are rolled back.
    pub fn finish(&mut self) {
        self.outputs.finish = true;
    }

    /// Once this iteration commits, stops the current round, runs `thunk` serially after every
    /// worker returned and then resumes the loop.
    pub fn suspend_with(&mut self, thunk: impl FnOnce() + Send + 'static) {
        self.outputs.suspend.push(Box::new(thunk));
    }

    pub(crate) fn into_outputs(self) -> IterationOutputs<T> {
        self.outputs
    }
}
