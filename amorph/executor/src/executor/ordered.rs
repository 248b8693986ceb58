// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{
    reinsert,
    reorder_buffer::{ReorderBuffer, RobEntry},
    run_body, BodyOutcome, RoundControl,
};
use crate::{
    config::RuntimeConfig,
    context::{ForeachContext, IterationOutputs},
    counters,
    errors::{invariant_violation, ExecutionError, ExecutionResult, IterationError, IterationResult},
    flags::MethodFlag,
    iteration::{Arbiter, Iteration, IterationId, IterationStatus},
    process::{run_workers, Backoff, Idle, IterationStatistics, StatsRecorder, Termination},
};
use amorph_worklist::{Comparator, OrderedWorklist, Rejected, ThreadCtx, Worklist};
use arc_swap::ArcSwapOption;
use crossbeam::{queue::SegQueue, utils::CachePadded};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::ThreadPool;
use std::{
    cmp::Ordering,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace};

const EXECUTOR: &str = "ordered";
const FREE_WAIT: Duration = Duration::from_millis(1);

/// Iteration slots not currently scheduled.
struct FreeList {
    queue: SegQueue<IterationId>,
    lock: Mutex<()>,
    available: Condvar,
}

impl FreeList {
    fn new(num_slots: usize) -> Self {
        let queue = SegQueue::new();
        for id in 0..num_slots {
            queue.push(id);
        }
        Self {
            queue,
            lock: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    fn push(&self, id: IterationId) {
        self.queue.push(id);
        let _guard = self.lock.lock();
        self.available.notify_one();
    }

    fn pop(&self) -> Option<IterationId> {
        self.queue.pop()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<IterationId> {
        if let Some(id) = self.queue.pop() {
            return Some(id);
        }
        let mut guard = self.lock.lock();
        if let Some(id) = self.queue.pop() {
            return Some(id);
        }
        self.available.wait_for(&mut guard, timeout);
        self.queue.pop()
    }
}

/// Speculative foreach over an ordered worklist, committing iterations in non-decreasing
/// priority order through a reorder buffer (ROB).
///
/// Every worker polls an item and inserts its iteration into the ROB in one critical section,
/// so the ROB together with the worklist always holds every uncommitted item. An iteration
/// whose body returned waits in the ROB as 'ReadyToCommit' and is committed, by whichever
/// thread sweeps the ROB, once it is the ROB head and no smaller item is left in the worklist.
///
/// Conflicts are resolved in favor of the smaller item: the loser is either told to abort
/// itself (still running) or aborted on the spot (ready to commit), and the winner waits
/// until the loser retired before retrying the lock.
///
/// Lock order is ROB, then worklist. Nobody waits on an iteration while holding the ROB lock.
pub struct OrderedExecutor {
    config: RuntimeConfig,
    thread_pool: Arc<ThreadPool>,
}

impl OrderedExecutor {
    pub fn new(config: &RuntimeConfig, thread_pool: Arc<ThreadPool>) -> Self {
        assert!(
            config.threads > 0 && config.threads <= thread_pool.current_num_threads(),
            "[Amorph]: invalid number of threads {}",
            config.threads
        );
        assert!(
            config.iteration_multiplier > 0,
            "[Amorph]: iteration multiplier must be positive"
        );
        Self {
            config: config.clone(),
            thread_pool,
        }
    }

    pub fn call<T, W, F>(&self, body: F, worklist: Arc<W>) -> ExecutionResult<IterationStatistics>
    where
        T: Clone + Send + Sync + 'static,
        W: OrderedWorklist<T> + 'static,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        let _timer = counters::CALL_SECONDS
            .with_label_values(&[EXECUTOR])
            .start_timer();
        let num_threads = self.config.threads;
        let stats = Arc::new(StatsRecorder::new(EXECUTOR, num_threads));
        info!(
            "[Amorph]: ordered foreach over {} items on {} threads, {} iteration slots",
            worklist.size(),
            num_threads,
            self.config.max_iterations()
        );

        loop {
            stats.round();
            let round = OrderedRound::new(&self.config, worklist.clone(), stats.clone());
            run_workers(&self.thread_pool, num_threads, |thread_id| {
                round.worker_loop(thread_id, &body, self.config.backoff)
            });
            round.drain_rob();
            if !round.control.end_round()? {
                break;
            }
            debug!("[Amorph]: restarting ordered round after suspension");
        }

        Ok(stats.snapshot())
    }
}

struct OrderedRound<T, W> {
    worklist: Arc<W>,
    comparator: Comparator<T>,
    iterations: Vec<Iteration>,
    // Item of each scheduled iteration, read by arbitration on other threads.
    items: Vec<ArcSwapOption<T>>,
    outputs: Vec<Mutex<IterationOutputs<T>>>,
    rob: CachePadded<Mutex<ReorderBuffer<T>>>,
    free: FreeList,
    termination: Termination,
    control: RoundControl,
    stats: Arc<StatsRecorder>,
    free_iteration_attempts: usize,
}

impl<T, W> OrderedRound<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: OrderedWorklist<T> + 'static,
{
    fn new(config: &RuntimeConfig, worklist: Arc<W>, stats: Arc<StatsRecorder>) -> Arc<Self> {
        let num_slots = config.max_iterations();
        let comparator = worklist.comparator().clone();
        Arc::new_cyclic(|round: &Weak<Self>| {
            let arbiter: Weak<dyn Arbiter> = round.clone();
            OrderedRound {
                worklist,
                rob: CachePadded::new(Mutex::new(ReorderBuffer::new(comparator.clone()))),
                comparator,
                iterations: (0..num_slots)
                    .map(|id| Iteration::new(id, MethodFlag::ALL, arbiter.clone()))
                    .collect(),
                items: (0..num_slots).map(|_| ArcSwapOption::empty()).collect(),
                outputs: (0..num_slots)
                    .map(|_| Mutex::new(IterationOutputs::default()))
                    .collect(),
                free: FreeList::new(num_slots),
                termination: Termination::new(config.threads),
                control: RoundControl::default(),
                stats,
                free_iteration_attempts: config.free_iteration_attempts,
            }
        })
    }

    fn worker_loop<F>(&self, thread_id: usize, body: &F, backoff: bool)
    where
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        let _guard = scopeguard::guard_on_unwind((), |_| self.termination.stop());
        let thread = ThreadCtx::new(thread_id);
        let mut backoff = Backoff::new(backoff);

        while !self.termination.is_done() {
            let Some(id) = self.new_iteration(thread) else {
                break;
            };
            let Some(item) = self.schedule(id, thread) else {
                self.recycle(id);
                let start = Instant::now();
                let outcome = self.termination.idle(|| self.last_idle_check(thread));
                self.stats.idle(thread_id, start.elapsed());
                match outcome {
                    Idle::Work(()) | Idle::Retry => continue,
                    Idle::Done => break,
                }
            };

            let iteration = &self.iterations[id];
            let worklist: &dyn Worklist<T> = &*self.worklist;
            let mut ctx = ForeachContext::new(iteration, Some(worklist), thread);
            match run_body(body, &*item, &mut ctx) {
                BodyOutcome::Commit => {
                    *self.outputs[id].lock() = ctx.into_outputs();
                    if iteration
                        .try_transition(IterationStatus::Scheduled, IterationStatus::ReadyToCommit)
                    {
                        backoff.committed();
                    } else {
                        self.abort_own(id, &item, thread);
                        backoff.aborted(|d| self.termination.sleep(d));
                    }
                },
                BodyOutcome::Abort => {
                    drop(ctx);
                    self.abort_own(id, &item, thread);
                    backoff.aborted(|d| self.termination.sleep(d));
                },
                BodyOutcome::Failed(error) => {
                    drop(ctx);
                    self.abort_own(id, &item, thread);
                    self.control.fail(error);
                    self.termination.stop();
                },
            }
            self.clear_rob(thread);
        }
    }

    /// Polls the next item into iteration `id`. Polling and the ROB insertion happen under the
    /// ROB lock, so no sweep can miss an item that left the worklist.
    fn schedule(&self, id: IterationId, thread: ThreadCtx) -> Option<Arc<T>> {
        let mut rob = self.rob.lock();
        let item = Arc::new(self.worklist.poll(thread)?);
        let iteration = &self.iterations[id];
        iteration.set_thread_id(thread.thread_id());
        self.items[id].store(Some(item.clone()));
        iteration.set_status(IterationStatus::Scheduled);
        rob.push(item.clone(), id);
        Some(item)
    }

    fn new_iteration(&self, thread: ThreadCtx) -> Option<IterationId> {
        for _ in 0..self.free_iteration_attempts {
            if let Some(id) = self.free.pop() {
                return Some(id);
            }
            self.clear_rob(thread);
        }
        loop {
            if let Some(id) = self.reclaim(thread) {
                return Some(id);
            }
            if self.termination.is_done() {
                return None;
            }
            if let Some(id) = self.free.pop_timeout(FREE_WAIT) {
                return Some(id);
            }
            self.clear_rob(thread);
        }
    }

    /// Takes a slot away from the ROB: an aborted entry if there is one, otherwise the largest
    /// ready entry that cannot commit before some item still in the worklist.
    fn reclaim(&self, thread: ThreadCtx) -> Option<IterationId> {
        let mut rob = self.rob.lock();
        if let Some(entry) = rob.remove_first(|entry| {
            self.iterations[entry.id].status() == IterationStatus::AbortDone
        }) {
            self.reset_slot(entry.id);
            return Some(entry.id);
        }

        let next = self.worklist.peek()?;
        let victim = rob
            .iter()
            .filter(|entry| {
                self.iterations[entry.id].status() == IterationStatus::ReadyToCommit
                    && (self.comparator)(&*entry.item, &next) == Ordering::Greater
            })
            .max_by(|a, b| (self.comparator)(&*a.item, &*b.item).then(a.id.cmp(&b.id)))
            .map(|entry| entry.id)?;
        if !self.iterations[victim].try_transition(
            IterationStatus::ReadyToCommit,
            IterationStatus::Aborting,
        ) {
            return None;
        }
        trace!("[Amorph]: reclaiming ready iteration {}", victim);
        if let Some(item) = self.roll_back(victim) {
            self.requeue_locked(&mut rob, T::clone(&item), thread);
        }
        self.retire_aborted(victim);
        rob.remove_first(|entry| entry.id == victim);
        self.reset_slot(victim);
        Some(victim)
    }

    /// Re-adds the item of an 'Aborting' iteration while its entry is still in the ROB, where it
    /// holds back every larger commit. The ROB lock is released between rejected attempts so
    /// that other workers can drain the worklist.
    fn requeue_locked(
        &self,
        rob: &mut MutexGuard<'_, ReorderBuffer<T>>,
        mut item: T,
        thread: ThreadCtx,
    ) {
        loop {
            match self.worklist.add_aborted(item, thread) {
                Ok(()) => break,
                Err(Rejected(rejected)) => {
                    item = rejected;
                    counters::ADD_ABORTED_RETRIES.inc();
                    MutexGuard::unlocked(rob, std::thread::yield_now);
                },
            }
        }
        self.termination.work_added();
    }

    fn reset_slot(&self, id: IterationId) {
        self.iterations[id].reset();
        self.items[id].store(None);
    }

    fn recycle(&self, id: IterationId) {
        self.reset_slot(id);
        self.free.push(id);
    }

    /// Serial check run by the last idle worker.
    fn last_idle_check(&self, thread: ThreadCtx) -> Option<()> {
        self.clear_rob(thread);
        if self.control.stopping() {
            return None;
        }
        if !self.worklist.is_empty() {
            return Some(());
        }
        let pending = self.rob.lock().len();
        if pending > 0 {
            self.control.fail(invariant_violation(format!(
                "all workers idle with an empty worklist and {} iterations in the reorder buffer",
                pending
            )));
        }
        None
    }

    /// Commits the ROB head while it is ready and minimal, and recycles aborted heads.
    fn clear_rob(&self, thread: ThreadCtx) {
        let mut rob = self.rob.lock();
        while !self.control.stopping() {
            let Some((id, item)) = rob.head() else {
                break;
            };
            let iteration = &self.iterations[id];
            match iteration.status() {
                IterationStatus::ReadyToCommit => {
                    let is_least = match self.worklist.peek() {
                        None => true,
                        Some(next) => (self.comparator)(&*item, &next) != Ordering::Greater,
                    };
                    if !is_least
                        || !iteration.try_transition(
                            IterationStatus::ReadyToCommit,
                            IterationStatus::Committing,
                        )
                    {
                        break;
                    }
                    rob.pop();
                    self.commit(id, thread);
                },
                IterationStatus::AbortDone => {
                    rob.pop();
                    self.recycle(id);
                },
                status @ (IterationStatus::CommitDone | IterationStatus::Unscheduled) => {
                    self.control.fail(invariant_violation(format!(
                        "iteration {} at the reorder buffer head in state {:?}",
                        id, status
                    )));
                    self.termination.stop();
                    break;
                },
                _ => break,
            }
        }
    }

    // Called under the ROB lock with the iteration in 'Committing'.
    fn commit(&self, id: IterationId, thread: ThreadCtx) {
        let iteration = &self.iterations[id];
        let outputs = std::mem::take(&mut *self.outputs[id].lock());
        iteration.perform_commit();

        let added = !outputs.items.is_empty();
        for item in outputs.items {
            if self.worklist.add(item, thread).is_err() {
                self.control.fail(ExecutionError::WorklistRejected);
                self.termination.stop();
                break;
            }
        }
        if added {
            self.termination.work_added();
        }
        if self.control.committed(outputs.finish, outputs.suspend) {
            self.termination.stop();
        }

        iteration.retire(IterationStatus::CommitDone);
        self.stats.committed(iteration.thread_id());
        self.recycle(id);
    }

    /// Rolls back the caller's own iteration, which stays in the ROB as 'AbortDone'.
    fn abort_own(&self, id: IterationId, item: &Arc<T>, thread: ThreadCtx) {
        let iteration = &self.iterations[id];
        if !iteration.try_transition(IterationStatus::Scheduled, IterationStatus::Aborting)
            && !iteration.try_transition(IterationStatus::AbortSelf, IterationStatus::Aborting)
        {
            self.control.fail(invariant_violation(format!(
                "iteration {} aborting from state {:?}",
                id,
                iteration.status()
            )));
            self.termination.stop();
            return;
        }
        iteration.perform_abort();
        self.outputs[id].lock().clear();
        reinsert(&*self.worklist, T::clone(item), thread);
        self.termination.work_added();
        iteration.retire(IterationStatus::AbortDone);
        self.stats.aborted(thread.thread_id());
    }

    /// Rolls back a ready iteration the caller moved to 'Aborting'. Must not be called under
    /// the ROB lock.
    fn abort_ready(&self, id: IterationId, thread: ThreadCtx) {
        if let Some(item) = self.roll_back(id) {
            reinsert(&*self.worklist, T::clone(&item), thread);
            self.termination.work_added();
        }
        self.retire_aborted(id);
    }

    // Undoes an 'Aborting' iteration and returns its item for re-insertion.
    fn roll_back(&self, id: IterationId) -> Option<Arc<T>> {
        self.iterations[id].perform_abort();
        self.outputs[id].lock().clear();
        self.items[id].load_full()
    }

    fn retire_aborted(&self, id: IterationId) {
        let iteration = &self.iterations[id];
        iteration.retire(IterationStatus::AbortDone);
        self.stats.aborted(iteration.thread_id());
    }

    /// Rolls back whatever a stopped round left in the ROB. Only ready or aborted iterations
    /// can remain once every worker returned.
    fn drain_rob(&self) {
        let entries: Vec<RobEntry<T>> = self.rob.lock().drain();
        if !entries.is_empty() {
            debug!(
                "[Amorph]: rolling back {} iterations after an early stop",
                entries.len()
            );
        }
        for entry in entries {
            let iteration = &self.iterations[entry.id];
            match iteration.status() {
                IterationStatus::ReadyToCommit => {
                    iteration.set_status(IterationStatus::Aborting);
                    iteration.perform_abort();
                    self.outputs[entry.id].lock().clear();
                    reinsert(&*self.worklist, T::clone(&entry.item), ThreadCtx::new(0));
                    iteration.retire(IterationStatus::AbortDone);
                    self.stats.aborted(iteration.thread_id());
                },
                IterationStatus::AbortDone => {},
                status => {
                    self.control.fail(invariant_violation(format!(
                        "iteration {} left in the reorder buffer in state {:?}",
                        entry.id, status
                    )));
                },
            }
            self.reset_slot(entry.id);
        }
    }
}

impl<T, W> Arbiter for OrderedRound<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: OrderedWorklist<T> + 'static,
{
    fn arbitrate(&self, current: &Iteration, owner: IterationId) -> IterationResult {
        if current.status() == IterationStatus::AbortSelf {
            return Err(IterationError::Abort);
        }
        let Some(other) = self.iterations.get(owner) else {
            return Err(IterationError::Abort);
        };
        let epoch = other.retire_epoch();
        let status = other.status();
        if status.is_retired() {
            return Ok(());
        }
        let (Some(mine), Some(theirs)) = (
            self.items[current.id()].load_full(),
            self.items[owner].load_full(),
        ) else {
            return Ok(());
        };
        let order = (self.comparator)(&*mine, &*theirs).then(current.id().cmp(&owner));
        if order != Ordering::Less {
            trace!(
                "[Amorph]: iteration {} loses against iteration {} ({:?})",
                current.id(),
                owner,
                status
            );
            return Err(IterationError::Abort);
        }

        match status {
            IterationStatus::Scheduled => {
                if !other.try_transition(IterationStatus::Scheduled, IterationStatus::AbortSelf) {
                    return Ok(());
                }
                trace!(
                    "[Amorph]: iteration {} asks iteration {} to abort",
                    current.id(),
                    owner
                );
            },
            IterationStatus::ReadyToCommit => {
                if other.try_transition(IterationStatus::ReadyToCommit, IterationStatus::Aborting)
                {
                    trace!(
                        "[Amorph]: iteration {} aborts ready iteration {}",
                        current.id(),
                        owner
                    );
                    let thread = ThreadCtx::new(current.thread_id());
                    self.abort_ready(owner, thread);
                    self.clear_rob(thread);
                }
                return Ok(());
            },
            _ => {},
        }
        counters::ARBITRATION_WAITS.inc();
        other.wait_retired(epoch);
        Ok(())
    }
}
