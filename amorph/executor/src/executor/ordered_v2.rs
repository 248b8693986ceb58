// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{reinsert, run_body, BodyOutcome, RoundControl, SerialExecutor};
use crate::{
    config::RuntimeConfig,
    context::{ForeachContext, IterationOutputs},
    counters,
    errors::{invariant_violation, ExecutionResult, IterationError, IterationResult},
    flags::MethodFlag,
    iteration::{Arbiter, Iteration, IterationId, IterationStatus},
    process::{run_workers, Backoff, IterationStatistics, Signal, StatsRecorder},
};
use amorph_worklist::{Comparator, Ordered, OrderedWorklist, ThreadCtx, Worklist};
use arc_swap::ArcSwapOption;
use crossbeam::{queue::SegQueue, utils::CachePadded};
use parking_lot::Mutex;
use rayon::ThreadPool;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tracing::{debug, info, trace};

const EXECUTOR: &str = "ordered_v2";
const UNCLAIMED: usize = 0;
const WAIT_INTERVAL: Duration = Duration::from_millis(1);

/// A user item wrapped with its claim state. The same wrapper may sit in several queues, the
/// owner CAS decides which iteration runs it.
struct WorkItem<T> {
    item: T,
    // UNCLAIMED, or the id of the claiming iteration plus one.
    owner: AtomicUsize,
    // Set by the committer once the item is next in commit order.
    least: AtomicBool,
    distributed: AtomicUsize,
    done: AtomicBool,
}

impl<T> WorkItem<T> {
    fn new(item: T) -> Arc<Self> {
        Arc::new(Self {
            item,
            owner: AtomicUsize::new(UNCLAIMED),
            least: AtomicBool::new(false),
            distributed: AtomicUsize::new(0),
            done: AtomicBool::new(false),
        })
    }

    fn is_least(&self) -> bool {
        self.least.load(Ordering::SeqCst)
    }
}

type Work<T> = Arc<WorkItem<T>>;

struct WorkerQueues<T> {
    // Filled by the committer with the least item while nobody claimed it.
    immediate: SegQueue<Work<T>>,
    // Iteration slots of this worker retired by other threads.
    freed: SegQueue<IterationId>,
}

/// Ordered speculative foreach driven by a dedicated committer thread.
///
/// The committer (the last thread) holds every uncommitted item in a serial ordered list, which
/// defines the commit order. It marks the next item in that order as least, hands it to idle
/// workers until one of them claims it, and commits its iteration once it is ready. Workers run
/// items out of a shared ordered list and park finished iterations until the committer takes
/// them. Only the iteration holding the least item wins conflicts, every other conflicting
/// iteration aborts. With a single thread the loop runs serially.
pub struct OrderedV2Executor {
    config: RuntimeConfig,
    thread_pool: Arc<ThreadPool>,
}

impl OrderedV2Executor {
    pub fn new(config: &RuntimeConfig, thread_pool: Arc<ThreadPool>) -> Self {
        assert!(
            config.threads > 0 && config.threads <= thread_pool.current_num_threads(),
            "[Amorph]: invalid number of threads {}",
            config.threads
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
        if self.config.threads == 1 {
            debug!("[Amorph]: single thread, running ordered foreach serially");
            return SerialExecutor::new().call(body, worklist);
        }
        let _timer = counters::CALL_SECONDS
            .with_label_values(&[EXECUTOR])
            .start_timer();
        let num_threads = self.config.threads;
        let stats = Arc::new(StatsRecorder::new(EXECUTOR, num_threads));
        info!(
            "[Amorph]: committer based foreach over {} items on {} threads",
            worklist.size(),
            num_threads
        );

        loop {
            stats.round();
            let initial: Vec<T> = std::iter::from_fn(|| worklist.polls()).collect();
            let round = V2Round::new(
                &self.config,
                worklist.comparator().clone(),
                stats.clone(),
                initial,
            );
            let committer = round.num_workers;
            run_workers(&self.thread_pool, num_threads, |thread_id| {
                if thread_id == committer {
                    round.committer_loop();
                } else {
                    round.worker_loop(thread_id, &body, self.config.backoff);
                }
            });
            for item in round.take_remaining() {
                reinsert(&*worklist, item, ThreadCtx::new(0));
            }
            if !round.control.end_round()? {
                break;
            }
            debug!("[Amorph]: restarting committer based round after suspension");
        }

        Ok(stats.snapshot())
    }
}

struct V2Round<T> {
    comparator: Comparator<T>,
    num_workers: usize,
    slots_per_worker: usize,
    iterations: Vec<Iteration>,
    claims: Vec<ArcSwapOption<WorkItem<T>>>,
    outputs: Vec<Mutex<IterationOutputs<T>>>,
    workers: Vec<CachePadded<WorkerQueues<T>>>,
    // Drawn from by every worker.
    shared: Ordered<Work<T>>,
    // Only touched by the committer.
    commit_list: Ordered<Work<T>>,
    progress: Signal,
    work_ready: Signal,
    done: AtomicBool,
    control: RoundControl,
    stats: Arc<StatsRecorder>,
}

impl<T> V2Round<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(
        config: &RuntimeConfig,
        comparator: Comparator<T>,
        stats: Arc<StatsRecorder>,
        initial: Vec<T>,
    ) -> Arc<Self> {
        let num_workers = config.threads - 1;
        let slots_per_worker = (config.v2_pool_size / num_workers).max(1);
        let num_slots = slots_per_worker * num_workers;
        let by_item = {
            let comparator = comparator.clone();
            move |a: &Work<T>, b: &Work<T>| comparator(&a.item, &b.item)
        };
        let by_item: Comparator<Work<T>> = Arc::new(by_item);

        let round = Arc::new_cyclic(|round: &Weak<Self>| {
            let arbiter: Weak<dyn Arbiter> = round.clone();
            V2Round {
                comparator,
                num_workers,
                slots_per_worker,
                iterations: (0..num_slots)
                    .map(|id| Iteration::new(id, MethodFlag::ALL, arbiter.clone()))
                    .collect(),
                claims: (0..num_slots).map(|_| ArcSwapOption::empty()).collect(),
                outputs: (0..num_slots)
                    .map(|_| Mutex::new(IterationOutputs::default()))
                    .collect(),
                workers: (0..num_workers)
                    .map(|_| {
                        CachePadded::new(WorkerQueues {
                            immediate: SegQueue::new(),
                            freed: SegQueue::new(),
                        })
                    })
                    .collect(),
                shared: Ordered::new(by_item.clone()),
                commit_list: Ordered::new(by_item),
                progress: Signal::new(),
                work_ready: Signal::new(),
                done: AtomicBool::new(false),
                control: RoundControl::default(),
                stats,
            }
        });
        let thread = ThreadCtx::new(num_workers);
        for item in initial {
            round.enqueue(WorkItem::new(item), thread);
        }
        round
    }

    fn worker_of(&self, id: IterationId) -> usize {
        id / self.slots_per_worker
    }

    fn enqueue(&self, work: Work<T>, thread: ThreadCtx) {
        reinsert(&self.commit_list, work.clone(), thread);
        reinsert(&self.shared, work, thread);
    }

    fn shutdown(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.work_ready.notify();
        self.progress.notify();
    }

    fn committer_loop(&self) {
        let _guard = scopeguard::guard((), |_| self.shutdown());
        let thread = ThreadCtx::new(self.num_workers);
        let mut next_worker = 0;

        while !self.control.stopping() {
            let Some(head) = self.commit_list.peek() else {
                break;
            };
            let seen = self.progress.epoch();
            head.least.store(true, Ordering::SeqCst);
            match head.owner.load(Ordering::SeqCst) {
                UNCLAIMED => {
                    if head.distributed.load(Ordering::SeqCst) < self.num_workers {
                        head.distributed.fetch_add(1, Ordering::SeqCst);
                        self.workers[next_worker].immediate.push(head);
                        next_worker = (next_worker + 1) % self.num_workers;
                        self.work_ready.notify();
                    } else {
                        self.progress.wait_since(seen, WAIT_INTERVAL);
                    }
                },
                owner => {
                    if !self.try_commit(owner - 1, &head, thread) {
                        self.progress.wait_since(seen, WAIT_INTERVAL);
                    }
                },
            }
        }
    }

    fn try_commit(&self, id: IterationId, head: &Work<T>, thread: ThreadCtx) -> bool {
        let iteration = &self.iterations[id];
        if !iteration.try_transition(IterationStatus::ReadyToCommit, IterationStatus::Committing) {
            return false;
        }
        let claimed = self.claims[id]
            .load_full()
            .is_some_and(|work| Arc::ptr_eq(&work, head));
        if !claimed {
            // The slot moved on to another item since the owner was read.
            iteration.set_status(IterationStatus::ReadyToCommit);
            return false;
        }

        // The head leaves the commit list before new items, which may sort before it, go in.
        let polled = self.commit_list.polls();
        debug_assert!(polled.is_some_and(|work| Arc::ptr_eq(&work, head)));

        let outputs = std::mem::take(&mut *self.outputs[id].lock());
        iteration.perform_commit();
        let added = !outputs.items.is_empty();
        for item in outputs.items {
            self.enqueue(WorkItem::new(item), thread);
        }
        self.control.committed(outputs.finish, outputs.suspend);

        head.done.store(true, Ordering::SeqCst);
        self.claims[id].store(None);
        iteration.retire(IterationStatus::CommitDone);
        self.stats.committed(iteration.thread_id());
        iteration.reset();
        self.workers[self.worker_of(id)].freed.push(id);
        if added {
            self.work_ready.notify();
        }
        true
    }

    fn worker_loop<F>(&self, thread_id: usize, body: &F, backoff: bool)
    where
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        let _guard = scopeguard::guard_on_unwind((), |_| {
            self.control.fail(invariant_violation(format!(
                "worker {} unwound outside of the loop body",
                thread_id
            )));
            self.shutdown();
        });
        let thread = ThreadCtx::new(thread_id);
        let queues = &self.workers[thread_id];
        let first_slot = thread_id * self.slots_per_worker;
        let mut free_slots: Vec<IterationId> =
            (first_slot..first_slot + self.slots_per_worker).collect();
        let mut ready: Vec<IterationId> = Vec::new();
        let mut self_queue: VecDeque<Work<T>> = VecDeque::new();
        let mut backoff = Backoff::new(backoff);

        while !self.done.load(Ordering::SeqCst) {
            while let Some(id) = queues.freed.pop() {
                ready.retain(|pending| *pending != id);
                free_slots.push(id);
            }
            let seen = self.work_ready.epoch();
            let Some(work) = self_queue
                .pop_front()
                .or_else(|| queues.immediate.pop())
                .or_else(|| self.shared.poll(thread))
            else {
                self.work_ready.wait_since(seen, WAIT_INTERVAL);
                continue;
            };
            if work.done.load(Ordering::SeqCst) || work.owner.load(Ordering::SeqCst) != UNCLAIMED
            {
                continue;
            }
            let Some(id) = free_slots.pop() else {
                self.reclaim(&ready, thread);
                self_queue.push_front(work);
                self.work_ready.wait_since(seen, WAIT_INTERVAL);
                continue;
            };
            if work
                .owner
                .compare_exchange(UNCLAIMED, id + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                free_slots.push(id);
                continue;
            }

            let iteration = &self.iterations[id];
            iteration.set_thread_id(thread_id);
            self.claims[id].store(Some(work.clone()));
            iteration.set_status(IterationStatus::Scheduled);
            let mut ctx = ForeachContext::new(iteration, None, thread);
            match run_body(body, &work.item, &mut ctx) {
                BodyOutcome::Commit => {
                    *self.outputs[id].lock() = ctx.into_outputs();
                    if iteration
                        .try_transition(IterationStatus::Scheduled, IterationStatus::ReadyToCommit)
                    {
                        ready.push(id);
                        self.progress.notify();
                        backoff.committed();
                    } else {
                        self.abort_own(id, &work, &mut self_queue, thread);
                        free_slots.push(id);
                        backoff.aborted(|d| self.work_ready.wait_since(self.work_ready.epoch(), d));
                    }
                },
                BodyOutcome::Abort => {
                    drop(ctx);
                    self.abort_own(id, &work, &mut self_queue, thread);
                    free_slots.push(id);
                    backoff.aborted(|d| self.work_ready.wait_since(self.work_ready.epoch(), d));
                },
                BodyOutcome::Failed(error) => {
                    drop(ctx);
                    self.abort_own(id, &work, &mut self_queue, thread);
                    self.control.fail(error);
                    self.shutdown();
                    break;
                },
            }
        }
    }

    /// Aborts the largest ready iteration of this worker that is not next in commit order, so
    /// that its slot can run a more urgent item.
    fn reclaim(&self, ready: &[IterationId], thread: ThreadCtx) {
        let victim = ready
            .iter()
            .filter_map(|id| self.claims[*id].load_full().map(|work| (*id, work)))
            .filter(|(_, work)| !work.is_least())
            .max_by(|(id_a, a), (id_b, b)| {
                (self.comparator)(&a.item, &b.item).then(id_a.cmp(id_b))
            })
            .map(|(id, _)| id);
        if let Some(victim) = victim {
            if self.iterations[victim]
                .try_transition(IterationStatus::ReadyToCommit, IterationStatus::Aborting)
            {
                trace!("[Amorph]: reclaiming ready iteration {}", victim);
                self.abort_ready(victim, thread);
            }
        }
    }

    /// Rolls back the caller's own running iteration and releases its claim.
    fn abort_own(
        &self,
        id: IterationId,
        work: &Work<T>,
        self_queue: &mut VecDeque<Work<T>>,
        thread: ThreadCtx,
    ) {
        let iteration = &self.iterations[id];
        if !iteration.try_transition(IterationStatus::Scheduled, IterationStatus::Aborting)
            && !iteration.try_transition(IterationStatus::AbortSelf, IterationStatus::Aborting)
        {
            self.control.fail(invariant_violation(format!(
                "iteration {} aborting from state {:?}",
                id,
                iteration.status()
            )));
            self.shutdown();
            return;
        }
        iteration.perform_abort();
        self.outputs[id].lock().clear();
        self.claims[id].store(None);
        work.owner.store(UNCLAIMED, Ordering::SeqCst);
        if work.is_least() {
            self_queue.push_back(work.clone());
        } else {
            reinsert(&self.shared, work.clone(), thread);
        }
        iteration.retire(IterationStatus::AbortDone);
        iteration.reset();
        self.stats.aborted(thread.thread_id());
        self.work_ready.notify();
        self.progress.notify();
    }

    /// Rolls back a ready iteration the caller moved to 'Aborting', handing the slot back to
    /// its worker.
    fn abort_ready(&self, id: IterationId, thread: ThreadCtx) {
        let iteration = &self.iterations[id];
        iteration.perform_abort();
        self.outputs[id].lock().clear();
        if let Some(work) = self.claims[id].swap(None) {
            work.owner.store(UNCLAIMED, Ordering::SeqCst);
            reinsert(&self.shared, work, thread);
        }
        iteration.retire(IterationStatus::AbortDone);
        self.stats.aborted(iteration.thread_id());
        iteration.reset();
        self.workers[self.worker_of(id)].freed.push(id);
        self.work_ready.notify();
        self.progress.notify();
    }

    /// Rolls back iterations left ready by an early stop and returns every uncommitted item.
    fn take_remaining(&self) -> Vec<T> {
        for iteration in &self.iterations {
            if iteration.try_transition(IterationStatus::ReadyToCommit, IterationStatus::Aborting)
            {
                iteration.perform_abort();
                self.outputs[iteration.id()].lock().clear();
                self.claims[iteration.id()].store(None);
                iteration.retire(IterationStatus::AbortDone);
                self.stats.aborted(iteration.thread_id());
                iteration.reset();
            }
        }
        let mut remaining = Vec::new();
        while let Some(work) = self.commit_list.polls() {
            if !work.done.load(Ordering::SeqCst) {
                remaining.push(work.item.clone());
            }
        }
        remaining
    }
}

impl<T> Arbiter for V2Round<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn arbitrate(&self, current: &Iteration, owner: IterationId) -> IterationResult {
        if current.status() == IterationStatus::AbortSelf {
            return Err(IterationError::Abort);
        }
        let is_least = self.claims[current.id()]
            .load_full()
            .is_some_and(|work| work.is_least());
        if !is_least {
            return Err(IterationError::Abort);
        }
        let Some(other) = self.iterations.get(owner) else {
            return Err(IterationError::Abort);
        };

        let epoch = other.retire_epoch();
        match other.status() {
            status if status.is_retired() => return Ok(()),
            IterationStatus::ReadyToCommit => {
                if other.try_transition(IterationStatus::ReadyToCommit, IterationStatus::Aborting)
                {
                    trace!(
                        "[Amorph]: least iteration {} aborts ready iteration {}",
                        current.id(),
                        owner
                    );
                    self.abort_ready(owner, ThreadCtx::new(current.thread_id()));
                }
                return Ok(());
            },
            IterationStatus::Scheduled => {
                if !other.try_transition(IterationStatus::Scheduled, IterationStatus::AbortSelf) {
                    return Ok(());
                }
            },
            _ => {},
        }
        counters::ARBITRATION_WAITS.inc();
        other.wait_retired(epoch);
        Ok(())
    }
}
