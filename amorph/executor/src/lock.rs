// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    context::ForeachContext,
    counters,
    errors::IterationResult,
    flags::MethodFlag,
    iteration::{Iteration, IterationId},
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

const FREE: usize = 0;

/// Owner word of an abstract lock: `0` when free, otherwise the owning iteration id plus one.
/// Shared between the lock and the owner's lock set so the owner can release it.
pub(crate) struct LockWord {
    owner: AtomicUsize,
}

impl LockWord {
    pub(crate) fn release(&self, id: IterationId) {
        let released = self
            .owner
            .compare_exchange(id + 1, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(released, "[Amorph]: iteration {} released a lock it did not own", id);
    }
}

/// Per-object exclusive lock acquired by iterations through [`Lockable::access`]. At most one
/// iteration owns the lock at a time, and ownership lasts until that iteration commits or
/// aborts.
pub struct AbstractLock {
    word: Arc<LockWord>,
}

impl AbstractLock {
    pub fn new() -> Self {
        Self {
            word: Arc::new(LockWord {
                owner: AtomicUsize::new(FREE),
            }),
        }
    }

    pub fn owner(&self) -> Option<IterationId> {
        match self.word.owner.load(Ordering::Acquire) {
            FREE => None,
            owner => Some(owner - 1),
        }
    }

    /// Acquires the lock for `iteration`, arbitrating until the lock is free or the iteration
    /// must abort. Returns whether the lock was newly acquired by this call.
    pub fn acquire(&self, iteration: &Iteration) -> IterationResult<bool> {
        let mine = iteration.id() + 1;
        loop {
            match self.word.owner.compare_exchange(
                FREE,
                mine,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    iteration.add_owned_lock(self.word.clone());
                    return Ok(true);
                },
                Err(owner) if owner == mine => return Ok(false),
                Err(owner) => {
                    counters::CONFLICTS.inc();
                    iteration.arbitrate(owner - 1)?;
                },
            }
        }
    }
}

impl Default for AbstractLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared objects call into the runtime before every read or write performed by an iteration.
pub trait Lockable {
    fn access(&self, iteration: &Iteration, flags: MethodFlag) -> IterationResult;
}

impl Lockable for AbstractLock {
    fn access(&self, iteration: &Iteration, flags: MethodFlag) -> IterationResult {
        if flags
            .intersection(iteration.mask())
            .contains(MethodFlag::CHECK_CONFLICT)
        {
            self.acquire(iteration)?;
        }
        Ok(())
    }
}

/// A value guarded by an abstract lock. Accesses with `SAVE_UNDO` snapshot the value the first
/// time the iteration locks it, and the snapshot is restored if the iteration aborts.
pub struct SharedCell<V> {
    lock: AbstractLock,
    value: Arc<Mutex<V>>,
}

impl<V> SharedCell<V>
where
    V: Clone + Send + 'static,
{
    pub fn new(value: V) -> Self {
        Self {
            lock: AbstractLock::new(),
            value: Arc::new(Mutex::new(value)),
        }
    }

    /// Speculative read on behalf of `iteration`.
    pub fn read(&self, iteration: &Iteration, flags: MethodFlag) -> IterationResult<V> {
        self.access(iteration, flags)?;
        Ok(self.value.lock().clone())
    }

    /// Speculative read-modify-write on behalf of `iteration`.
    pub fn update<R>(
        &self,
        iteration: &Iteration,
        flags: MethodFlag,
        f: impl FnOnce(&mut V) -> R,
    ) -> IterationResult<R> {
        self.access(iteration, flags)?;
        Ok(f(&mut self.value.lock()))
    }

    /// Non-speculative read, for use outside of executor calls.
    pub fn get(&self) -> V {
        self.value.lock().clone()
    }

    /// Non-speculative write, for use outside of executor calls.
    pub fn set(&self, value: V) {
        *self.value.lock() = value;
    }

    pub fn owner(&self) -> Option<IterationId> {
        self.lock.owner()
    }
}

impl<V> Lockable for SharedCell<V>
where
    V: Clone + Send + 'static,
{
    fn access(&self, iteration: &Iteration, flags: MethodFlag) -> IterationResult {
        let flags = flags.intersection(iteration.mask());
        let newly_locked = if flags.contains(MethodFlag::CHECK_CONFLICT) {
            self.lock.acquire(iteration)?
        } else {
            true
        };
        if newly_locked && flags.contains(MethodFlag::SAVE_UNDO) {
            let snapshot = self.value.lock().clone();
            let value = self.value.clone();
            iteration.on_undo(move || *value.lock() = snapshot);
        }
        Ok(())
    }
}

/// A commutative counter that suspends the loop once it reaches `count_to`. Increments never
/// conflict, so the counter takes no abstract lock. With `SAVE_UNDO` an increment only lands
/// when its iteration commits.
///
/// The threshold is checked against the committed value when the body increments. Iterations
/// racing past it together may miss the check, the next increment then suspends.
pub struct Counter {
    count_to: u64,
    value: Arc<AtomicU64>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl Counter {
    /// `callback` runs in the suspension after the round drained, with the counter reset to 0.
    pub fn new(count_to: u64, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            count_to: count_to.max(1),
            value: Arc::new(AtomicU64::new(0)),
            callback: Arc::new(callback),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }

    /// Non-speculative increment, for use outside of executor calls. Refuses to reach the
    /// threshold since there is no loop to suspend.
    pub fn add(&self, delta: u64) -> anyhow::Result<u64> {
        let value = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_add(delta).filter(|sum| *sum < self.count_to)
            })
            .map_err(|value| {
                anyhow::anyhow!(
                    "serial increment of {} by {} reaches threshold {}",
                    value,
                    delta,
                    self.count_to
                )
            })?;
        Ok(value + delta)
    }

    /// Increments on behalf of the iteration behind `ctx`.
    pub fn increment<T>(
        &self,
        ctx: &mut ForeachContext<'_, T>,
        delta: u64,
        flags: MethodFlag,
    ) -> IterationResult {
        let iteration = ctx.iteration();
        self.access(iteration, flags)?;
        let reached = if flags
            .intersection(iteration.mask())
            .contains(MethodFlag::SAVE_UNDO)
        {
            let value = self.value.clone();
            iteration.on_commit(move || {
                value.fetch_add(delta, Ordering::SeqCst);
            });
            self.get().saturating_add(delta) >= self.count_to
        } else {
            self.value.fetch_add(delta, Ordering::SeqCst).saturating_add(delta) >= self.count_to
        };
        if reached {
            let count_to = self.count_to;
            let value = self.value.clone();
            let callback = self.callback.clone();
            ctx.suspend_with(move || {
                // An earlier suspension of the same round may have reset it already.
                if value.load(Ordering::SeqCst) < count_to {
                    return;
                }
                value.store(0, Ordering::SeqCst);
                callback();
            });
        }
        Ok(())
    }
}

impl Lockable for Counter {
    fn access(&self, _iteration: &Iteration, _flags: MethodFlag) -> IterationResult {
        Ok(())
    }
}
