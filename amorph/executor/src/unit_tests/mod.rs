// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{ConfigError, OrderedExecutorKind, RuntimeConfig},
    errors::{ExecutionError, IterationError, IterationResult},
    flags::MethodFlag,
    iteration::{Arbiter, Iteration, IterationId, IterationStatus},
    lock::{AbstractLock, Counter, Lockable, SharedCell},
    mappable::{ListMapper, RangeMapper},
    runtime::Runtime,
    SerialExecutor,
};
use amorph_worklist::{
    Comparator, Fifo, Ordered, OrderedWorklist, Rejected, ThreadCtx, Worklist,
};
use anyhow::anyhow;
use claims::{assert_err, assert_matches, assert_none, assert_ok, assert_ok_eq, assert_some_eq};
use parking_lot::Mutex;
use proptest::{collection::vec, prelude::*};
use rand::{seq::SliceRandom, thread_rng};
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use test_case::test_case;

struct AlwaysAbort;

impl Arbiter for AlwaysAbort {
    fn arbitrate(&self, _current: &Iteration, _owner: IterationId) -> IterationResult {
        Err(IterationError::Abort)
    }
}

fn iterations(count: usize, mask: MethodFlag) -> (Arc<dyn Arbiter>, Vec<Iteration>) {
    let arbiter: Arc<dyn Arbiter> = Arc::new(AlwaysAbort);
    let iterations = (0..count)
        .map(|id| Iteration::new(id, mask, Arc::downgrade(&arbiter)))
        .collect();
    (arbiter, iterations)
}

fn runtime(threads: usize, executor: OrderedExecutorKind) -> Runtime {
    Runtime::new(RuntimeConfig {
        executor,
        ..RuntimeConfig::with_threads(threads)
    })
    .unwrap()
}

fn fifo_of<T: Send + Debug>(items: impl IntoIterator<Item = T>) -> Arc<Fifo<T>> {
    let worklist = Arc::new(Fifo::<T>::new());
    for item in items {
        worklist.add(item, ThreadCtx::default()).unwrap();
    }
    worklist
}

fn ordered_of<T: Ord + Send + Debug + 'static>(items: impl IntoIterator<Item = T>) -> Arc<Ordered<T>> {
    let worklist = Arc::new(Ordered::<T>::natural());
    for item in items {
        worklist.add(item, ThreadCtx::default()).unwrap();
    }
    worklist
}

/// Rejects the first `rejections` re-insertions of aborted items.
struct FlakyWorklist {
    inner: Fifo<usize>,
    rejections: AtomicUsize,
    rejected: AtomicUsize,
}

impl Worklist<usize> for FlakyWorklist {
    fn add(&self, item: usize, ctx: ThreadCtx) -> Result<(), Rejected<usize>> {
        self.inner.add(item, ctx)
    }

    fn add_aborted(&self, item: usize, ctx: ThreadCtx) -> Result<(), Rejected<usize>> {
        if self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(Rejected(item));
        }
        self.inner.add(item, ctx)
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<usize> {
        self.inner.poll(ctx)
    }

    fn polls(&self) -> Option<usize> {
        self.inner.polls()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

/// Ordered worklist that slows down the re-insertion of item 1, and refuses re-insertions of
/// other items until some worker polled again. Gives up refusing after `WAIT_LIMIT`, which
/// only happens when no other worker can reach the worklist.
struct HesitantOrdered {
    inner: Ordered<u32>,
    polled: AtomicUsize,
    pending: Mutex<Option<(usize, Instant)>>,
    waited_out: AtomicBool,
}

const WAIT_LIMIT: Duration = Duration::from_secs(2);

impl HesitantOrdered {
    fn new(items: impl IntoIterator<Item = u32>) -> Self {
        let inner = Ordered::natural();
        for item in items {
            inner.add(item, ThreadCtx::default()).unwrap();
        }
        Self {
            inner,
            polled: AtomicUsize::new(0),
            pending: Mutex::new(None),
            waited_out: AtomicBool::new(false),
        }
    }
}

impl Worklist<u32> for HesitantOrdered {
    fn add(&self, item: u32, ctx: ThreadCtx) -> Result<(), Rejected<u32>> {
        self.inner.add(item, ctx)
    }

    fn add_aborted(&self, item: u32, ctx: ThreadCtx) -> Result<(), Rejected<u32>> {
        if item == 1 {
            self.inner.add(item, ctx)?;
            thread::sleep(Duration::from_millis(50));
            return Ok(());
        }
        let polled = self.polled.load(Ordering::SeqCst);
        let mut pending = self.pending.lock();
        let (since, deadline) = *pending.get_or_insert((polled, Instant::now() + WAIT_LIMIT));
        if polled == since && Instant::now() < deadline {
            return Err(Rejected(item));
        }
        if polled == since {
            self.waited_out.store(true, Ordering::SeqCst);
        }
        *pending = None;
        self.inner.add(item, ctx)
    }

    fn poll(&self, ctx: ThreadCtx) -> Option<u32> {
        let item = self.inner.poll(ctx)?;
        self.polled.fetch_add(1, Ordering::SeqCst);
        Some(item)
    }

    fn polls(&self) -> Option<u32> {
        self.inner.polls()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

impl OrderedWorklist<u32> for HesitantOrdered {
    fn peek(&self) -> Option<u32> {
        self.inner.peek()
    }

    fn comparator(&self) -> &Comparator<u32> {
        self.inner.comparator()
    }
}

#[test]
fn method_flags() {
    assert!(MethodFlag::ALL.contains(MethodFlag::CHECK_CONFLICT));
    assert!(MethodFlag::ALL.contains(MethodFlag::SAVE_UNDO));
    assert!(!MethodFlag::CHECK_CONFLICT.contains(MethodFlag::SAVE_UNDO));
    assert!(!MethodFlag::ALL.contains(MethodFlag::NONE));
    assert_eq!(
        MethodFlag::CHECK_CONFLICT | MethodFlag::SAVE_UNDO,
        MethodFlag::ALL
    );
    assert!(MethodFlag::ALL.intersection(MethodFlag::NONE).is_empty());
}

#[test]
fn undo_runs_in_reverse_and_commit_in_order() {
    let (_arbiter, its) = iterations(2, MethodFlag::ALL);
    let log = Arc::new(Mutex::new(vec![]));
    for i in 0..3 {
        let log_undo = log.clone();
        its[0].on_undo(move || log_undo.lock().push(format!("undo{}", i)));
        let log_commit = log.clone();
        its[1].on_commit(move || log_commit.lock().push(format!("commit{}", i)));
    }
    let log_release = log.clone();
    its[0].on_release(move || log_release.lock().push("released".to_string()));

    its[0].perform_abort();
    its[1].perform_commit();
    assert_eq!(*log.lock(), vec![
        "undo2", "undo1", "undo0", "released", "commit0", "commit1", "commit2"
    ]);
}

#[test]
fn abort_is_idempotent() {
    let (_arbiter, its) = iterations(1, MethodFlag::ALL);
    let lock = AbstractLock::new();
    let undone = Arc::new(AtomicUsize::new(0));
    assert_ok_eq!(lock.acquire(&its[0]), true);
    let counter = undone.clone();
    its[0].on_undo(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(its[0].perform_abort(), 1);
    assert_eq!(its[0].perform_abort(), 0);
    assert_eq!(undone.load(Ordering::SeqCst), 1);
    assert_none!(lock.owner());
}

#[test]
fn concurrent_aborts_undo_once() {
    for _ in 0..50 {
        let (_arbiter, its) = iterations(1, MethodFlag::ALL);
        let undone = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = undone.clone();
            its[0].on_undo(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| its[0].perform_abort());
            }
        });
        assert_eq!(undone.load(Ordering::SeqCst), 8);
    }
}

#[test]
fn lock_has_at_most_one_owner() {
    let (_arbiter, its) = iterations(2, MethodFlag::ALL);
    let lock = AbstractLock::new();

    assert_ok_eq!(lock.acquire(&its[0]), true);
    assert_ok_eq!(lock.acquire(&its[0]), false);
    assert_eq!(its[0].num_owned_locks(), 1);
    assert_some_eq!(lock.owner(), 0);

    assert_matches!(
        lock.access(&its[1], MethodFlag::ALL),
        Err(IterationError::Abort)
    );
    // Accesses without conflict checking never touch the lock.
    assert_ok!(lock.access(&its[1], MethodFlag::SAVE_UNDO));
    assert_some_eq!(lock.owner(), 0);

    assert_eq!(its[0].perform_commit(), 1);
    assert_none!(lock.owner());
    assert_ok_eq!(lock.acquire(&its[1]), true);
    assert_some_eq!(lock.owner(), 1);
}

#[test]
fn shared_cell_restores_on_abort() {
    let (_arbiter, its) = iterations(1, MethodFlag::ALL);
    let cell = SharedCell::new(vec![1, 2]);

    cell.update(&its[0], MethodFlag::ALL, |v| v.push(3)).unwrap();
    // Only the first access of an iteration snapshots the value.
    cell.update(&its[0], MethodFlag::ALL, |v| v.push(4)).unwrap();
    assert_eq!(cell.get(), vec![1, 2, 3, 4]);

    its[0].perform_abort();
    assert_eq!(cell.get(), vec![1, 2]);
    assert_none!(cell.owner());
}

#[test]
fn masked_iteration_skips_locks_and_undo() {
    let (_arbiter, its) = iterations(1, MethodFlag::NONE);
    let cell = SharedCell::new(5);
    assert_ok_eq!(cell.update(&its[0], MethodFlag::ALL, |v| {
        *v += 1;
        *v
    }), 6);
    assert_none!(cell.owner());
    its[0].perform_abort();
    assert_eq!(cell.get(), 6);
}

#[test]
fn retirement_wakes_waiters() {
    let (_arbiter, its) = iterations(1, MethodFlag::ALL);
    let it = &its[0];
    it.set_status(IterationStatus::Scheduled);
    let epoch = it.retire_epoch();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            it.retire(IterationStatus::AbortDone);
        });
        it.wait_retired(epoch);
    });
    assert_eq!(it.status(), IterationStatus::AbortDone);
    assert!(it.status().is_retired());
    it.reset();
    assert_eq!(it.status(), IterationStatus::Unscheduled);
}

#[test_case(1)]
#[test_case(2)]
#[test_case(4)]
fn unordered_counter(threads: usize) {
    let runtime = runtime(threads, OrderedExecutorKind::Ordered);
    let counter = SharedCell::new(0u64);
    let stats = runtime
        .foreach(fifo_of(1..=1000u64), |item, ctx| {
            counter.update(ctx.iteration(), MethodFlag::ALL, |total| *total += *item)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(counter.get(), 500_500);
    assert_eq!(stats.committed(), 1000);
    assert_eq!(stats.rounds, 1);
}

#[test_case(2)]
#[test_case(4)]
fn unordered_new_work_is_published_on_commit(threads: usize) {
    let runtime = runtime(threads, OrderedExecutorKind::Ordered);
    let visits = (0..64).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
    runtime
        .foreach(fifo_of([1usize]), |item, ctx| {
            visits[*item].fetch_add(1, Ordering::SeqCst);
            for child in [2 * item, 2 * item + 1] {
                if child < visits.len() {
                    ctx.add(child)?;
                }
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(visits[0].load(Ordering::SeqCst), 0);
    assert!(visits[1..].iter().all(|v| v.load(Ordering::SeqCst) == 1));
}

#[test_case(1, OrderedExecutorKind::Ordered)]
#[test_case(2, OrderedExecutorKind::Ordered)]
#[test_case(4, OrderedExecutorKind::Ordered)]
#[test_case(2, OrderedExecutorKind::OrderedV2)]
#[test_case(4, OrderedExecutorKind::OrderedV2)]
fn ordered_commit_order(threads: usize, executor: OrderedExecutorKind) {
    let runtime = runtime(threads, executor);
    let committed = Arc::new(Mutex::new(vec![]));
    runtime
        .foreach_ordered(ordered_of([5, 3, 1, 4, 2]), |item, ctx| {
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();
    assert_eq!(*committed.lock(), vec![1, 2, 3, 4, 5]);
}

#[test_case(2, OrderedExecutorKind::Ordered)]
#[test_case(4, OrderedExecutorKind::Ordered)]
#[test_case(3, OrderedExecutorKind::OrderedV2)]
#[test_case(4, OrderedExecutorKind::OrderedV2)]
fn ordered_conflicting_items_commit_sorted(threads: usize, executor: OrderedExecutorKind) {
    let runtime = runtime(threads, executor);
    let cells: Vec<SharedCell<Vec<u32>>> = (0..4).map(|_| SharedCell::new(vec![])).collect();
    let committed = Arc::new(Mutex::new(vec![]));
    let mut items: Vec<u32> = (0..200).collect();
    items.shuffle(&mut thread_rng());

    runtime
        .foreach_ordered(ordered_of(items), |item, ctx| {
            cells[*item as usize % 4].update(ctx.iteration(), MethodFlag::ALL, |seen| {
                seen.push(*item)
            })?;
            if *item < 50 {
                ctx.add(*item + 1000)?;
            }
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();

    let committed = committed.lock().clone();
    let mut expected: Vec<u32> = (0..200).chain(1000..1050).collect();
    expected.sort();
    assert_eq!(committed, expected);
    for (residue, cell) in cells.iter().enumerate() {
        let seen = cell.get();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(seen.iter().all(|x| *x as usize % 4 == residue));
    }
}

#[test_case(2, OrderedExecutorKind::Ordered)]
#[test_case(3, OrderedExecutorKind::OrderedV2)]
fn lower_priority_sleeper_aborts(threads: usize, executor: OrderedExecutorKind) {
    let runtime = runtime(threads, executor);
    let cell = SharedCell::new(0u64);
    let committed = Arc::new(Mutex::new(vec![]));

    let stats = runtime
        .foreach_ordered(ordered_of([1u64, 2]), |item, ctx| {
            if *item == 1 {
                // Let the other iteration grab the cell first.
                let deadline = Instant::now() + Duration::from_secs(1);
                while cell.owner().is_none() && Instant::now() < deadline {
                    thread::yield_now();
                }
            }
            cell.update(ctx.iteration(), MethodFlag::ALL, |v| *v = *v * 10 + *item)?;
            if *item == 2 {
                thread::sleep(Duration::from_millis(50));
            }
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();

    assert_eq!(*committed.lock(), vec![1, 2]);
    assert_eq!(cell.get(), 12);
    assert!(stats.aborted() >= 1);
}

#[test]
fn rejected_reinsertions_are_retried() {
    let runtime = runtime(2, OrderedExecutorKind::Ordered);
    let worklist = Arc::new(FlakyWorklist {
        inner: Fifo::new(),
        rejections: AtomicUsize::new(2),
        rejected: AtomicUsize::new(0),
    });
    for item in 0..100 {
        worklist.add(item, ThreadCtx::default()).unwrap();
    }
    let attempts = AtomicUsize::new(0);
    let seen = (0..100).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();

    let stats = runtime
        .foreach(worklist.clone(), |item, _ctx| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                return Err(IterationError::Abort);
            }
            seen[*item].fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    assert_eq!(worklist.rejected.load(Ordering::SeqCst), 2);
    assert_eq!(stats.committed(), 100);
    assert_eq!(stats.aborted(), 3);
    assert!(seen.iter().all(|s| s.load(Ordering::SeqCst) == 1));
    assert!(worklist.is_empty());
}

#[test]
fn serial_finish_stops_early() {
    let processed = Mutex::new(vec![]);
    let worklist = fifo_of(0..10);
    let stats = SerialExecutor::new()
        .call(
            |item: &i32, ctx| {
                processed.lock().push(*item);
                if *item == 3 {
                    ctx.finish();
                }
                Ok(())
            },
            worklist.clone(),
        )
        .unwrap();
    assert_eq!(*processed.lock(), vec![0, 1, 2, 3]);
    assert_eq!(stats.committed(), 4);
    assert_eq!(worklist.size(), 6);
}

#[test]
fn serial_accesses_take_no_locks() {
    let cell = SharedCell::new(0);
    SerialExecutor::new()
        .call(
            |item: &i32, ctx| {
                cell.update(ctx.iteration(), MethodFlag::ALL, |v| *v += *item)?;
                assert_none!(cell.owner());
                if *item < 5 {
                    ctx.add(*item + 10)?;
                }
                Ok(())
            },
            fifo_of(0..10),
        )
        .unwrap();
    assert_eq!(cell.get(), 45 + 10 * 5 + 10);
}

#[test_case(2, OrderedExecutorKind::Ordered)]
#[test_case(4, OrderedExecutorKind::Ordered)]
#[test_case(3, OrderedExecutorKind::OrderedV2)]
fn ordered_finish_rolls_back_later_iterations(threads: usize, executor: OrderedExecutorKind) {
    let runtime = runtime(threads, executor);
    let committed = Arc::new(Mutex::new(vec![]));
    let worklist = ordered_of(0..20u32);
    runtime
        .foreach_ordered(worklist.clone(), |item, ctx| {
            if *item == 5 {
                ctx.finish();
            }
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();
    assert_eq!(*committed.lock(), (0..=5).collect::<Vec<_>>());
    assert_eq!(worklist.size(), 14);
    assert_some_eq!(worklist.peek(), 6);
}

#[test]
fn unordered_suspend_resumes_after_thunk() {
    let runtime = runtime(3, OrderedExecutorKind::Ordered);
    let thunk_ran = Arc::new(AtomicBool::new(false));
    let seen = (0..50).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
    let stats = runtime
        .foreach(fifo_of(0..50usize), |item, ctx| {
            if *item == 10 {
                let thunk_ran = thunk_ran.clone();
                ctx.suspend_with(move || thunk_ran.store(true, Ordering::SeqCst));
            }
            seen[*item].fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert!(thunk_ran.load(Ordering::SeqCst));
    assert_eq!(stats.rounds, 2);
    assert_eq!(stats.committed(), 50);
    assert!(seen.iter().all(|s| s.load(Ordering::SeqCst) == 1));
}

#[test_case(2, OrderedExecutorKind::Ordered)]
#[test_case(3, OrderedExecutorKind::OrderedV2)]
fn ordered_suspend_keeps_commit_order(threads: usize, executor: OrderedExecutorKind) {
    let runtime = runtime(threads, executor);
    let committed = Arc::new(Mutex::new(vec![]));
    let at_suspension = Arc::new(Mutex::new(vec![]));
    let stats = runtime
        .foreach_ordered(ordered_of(0..10u32), |item, ctx| {
            if *item == 4 {
                let committed = committed.clone();
                let at_suspension = at_suspension.clone();
                ctx.suspend_with(move || *at_suspension.lock() = committed.lock().clone());
            }
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();
    assert_eq!(*at_suspension.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(*committed.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(stats.rounds, 2);
}

#[test_case(1)]
#[test_case(3)]
fn user_error_stops_execution(threads: usize) {
    let runtime = runtime(threads, OrderedExecutorKind::Ordered);
    let cell = SharedCell::new(0);
    let result = runtime.foreach(fifo_of(0..100), |item: &i32, ctx| {
        if *item == 7 {
            cell.update(ctx.iteration(), MethodFlag::ALL, |v| *v = -1)?;
            return Err(anyhow!("item {} is poisoned", item).into());
        }
        Ok(())
    });
    assert_matches!(result, Err(ExecutionError::UserError(e)) if e.to_string().contains("poisoned"));
    // The failing iteration was rolled back.
    assert_eq!(cell.get(), 0);
}

#[test]
fn panicking_body_is_reported() {
    let runtime = runtime(2, OrderedExecutorKind::Ordered);
    let result = runtime.foreach(fifo_of(0..10), |item: &i32, _ctx| {
        if *item == 3 {
            panic!("kaboom");
        }
        Ok(())
    });
    assert_matches!(result, Err(ExecutionError::WorkerPanicked(msg)) if msg.contains("kaboom"));
}

#[test]
fn ordered_user_error_is_reported() {
    let runtime = runtime(2, OrderedExecutorKind::Ordered);
    let result = runtime.foreach_ordered(ordered_of(0..10), |item: &i32, _ctx| {
        if *item == 2 {
            return Err(IterationError::User(anyhow!("bad item")));
        }
        Ok(())
    });
    assert_err!(result);
}

#[test]
fn foreach_initial_spreads_items() {
    let runtime = runtime(2, OrderedExecutorKind::Ordered);
    let total = AtomicUsize::new(0);
    let stats = runtime
        .foreach_initial(0..10usize, Arc::new(Fifo::<usize>::new()), |item, _ctx| {
            total.fetch_add(*item, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 45);
    assert_eq!(stats.committed(), 10);
}

#[test]
fn serial_runtime_uses_the_calling_thread() {
    let runtime = Runtime::new(RuntimeConfig {
        serial: true,
        ..RuntimeConfig::with_threads(4)
    })
    .unwrap();
    let caller = thread::current().id();
    let stats = runtime
        .foreach_ordered(ordered_of([3, 1, 2]), |_item: &i32, _ctx| {
            assert_eq!(thread::current().id(), caller);
            Ok(())
        })
        .unwrap();
    assert_eq!(stats.committed(), 3);
}

#[test]
fn invalid_config_is_rejected() {
    assert_matches!(
        Runtime::new(RuntimeConfig::with_threads(0)),
        Err(ConfigError::ConfigSanitizerFailed(_, _))
    );
}

#[test_case(2, OrderedExecutorKind::Ordered)]
#[test_case(3, OrderedExecutorKind::OrderedV2)]
#[test_case(4, OrderedExecutorKind::OrderedV2)]
fn committed_child_sorting_before_pending_items(threads: usize, executor: OrderedExecutorKind) {
    let runtime = runtime(threads, executor);
    let committed = Arc::new(Mutex::new(vec![]));
    runtime
        .foreach_ordered(ordered_of([5u32, 7]), |item, ctx| {
            if *item == 5 {
                ctx.add(1)?;
            }
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();
    assert_eq!(*committed.lock(), vec![5, 1, 7]);
}

#[test]
fn reclaimed_item_requeues_without_holding_the_reorder_buffer() {
    let runtime = runtime(2, OrderedExecutorKind::Ordered);
    let worklist = Arc::new(HesitantOrdered::new([1, 5, 10]));
    let first_attempt = AtomicBool::new(true);
    let committed = Arc::new(Mutex::new(vec![]));
    runtime
        .foreach_ordered(worklist.clone(), |item, ctx| {
            if *item == 1 && first_attempt.swap(false, Ordering::SeqCst) {
                return Err(IterationError::Abort);
            }
            let committed = committed.clone();
            let item = *item;
            ctx.iteration()
                .on_commit(move || committed.lock().push(item));
            Ok(())
        })
        .unwrap();
    assert_eq!(*committed.lock(), vec![1, 5, 10]);
    assert!(!worklist.waited_out.load(Ordering::SeqCst));
}

#[test]
fn counter_suspends_every_count_to_serially() {
    let runtime = Runtime::new(RuntimeConfig {
        serial: true,
        ..RuntimeConfig::with_threads(2)
    })
    .unwrap();
    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = {
        let callbacks = callbacks.clone();
        Counter::new(10, move || {
            callbacks.fetch_add(1, Ordering::SeqCst);
        })
    };
    let stats = runtime
        .foreach(fifo_of(0..25u32), |_item, ctx| {
            counter.increment(ctx, 1, MethodFlag::ALL)
        })
        .unwrap();
    assert_eq!(stats.committed(), 25);
    assert_eq!(callbacks.load(Ordering::SeqCst), 2);
    assert_eq!(counter.get(), 5);
}

#[test]
fn counter_suspension_starts_new_rounds() {
    let runtime = runtime(1, OrderedExecutorKind::Ordered);
    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = {
        let callbacks = callbacks.clone();
        Counter::new(10, move || {
            callbacks.fetch_add(1, Ordering::SeqCst);
        })
    };
    let stats = runtime
        .foreach(fifo_of(0..25u32), |_item, ctx| {
            counter.increment(ctx, 1, MethodFlag::ALL)
        })
        .unwrap();
    assert_eq!(stats.committed(), 25);
    assert_eq!(stats.rounds, 3);
    assert_eq!(callbacks.load(Ordering::SeqCst), 2);
    assert_eq!(counter.get(), 5);
}

#[test_case(MethodFlag::ALL, 10)]
#[test_case(MethodFlag::NONE, 15)]
fn counter_increments_of_aborted_iterations(flags: MethodFlag, expected: u64) {
    let runtime = runtime(1, OrderedExecutorKind::Ordered);
    let counter = Counter::new(100, || {});
    let retried = (0..10).map(|_| AtomicBool::new(false)).collect::<Vec<_>>();
    runtime
        .foreach(fifo_of(0..10usize), |item, ctx| {
            counter.increment(ctx, 1, flags)?;
            if *item % 2 == 0 && !retried[*item].swap(true, Ordering::SeqCst) {
                return Err(IterationError::Abort);
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(counter.get(), expected);
}

#[test_case(2, 4)]
#[test_case(4, 1)]
fn counter_under_contention_fires(threads: usize, delta: u64) {
    let runtime = runtime(threads, OrderedExecutorKind::Ordered);
    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = {
        let callbacks = callbacks.clone();
        Counter::new(10, move || {
            callbacks.fetch_add(1, Ordering::SeqCst);
        })
    };
    let stats = runtime
        .foreach(fifo_of(0..40u32), |_item, ctx| {
            counter.increment(ctx, delta, MethodFlag::ALL)
        })
        .unwrap();
    assert_eq!(stats.committed(), 40);
    assert!(callbacks.load(Ordering::SeqCst) >= 1);
    assert!(counter.get() < 10 + threads as u64 * delta);
}

#[test]
fn counter_serial_add_stays_below_threshold() {
    let counter = Counter::new(10, || {});
    assert_ok_eq!(counter.add(3), 3);
    assert_err!(counter.add(7));
    assert_eq!(counter.get(), 3);
    assert_ok_eq!(counter.add(6), 9);
    counter.reset();
    assert_eq!(counter.get(), 0);
}

#[test_case(1)]
#[test_case(4)]
fn forall_maps_every_index_once(threads: usize) {
    let runtime = runtime(threads, OrderedExecutorKind::Ordered);
    let seen = (0..1000).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
    let stats = runtime
        .forall(&RangeMapper::new(0..1000), |index, _iteration| {
            seen[index].fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert_eq!(stats.committed(), 1000);
    assert_eq!(stats.aborted(), 0);
    assert_eq!(stats.rounds, 1);
    assert!(seen.iter().all(|s| s.load(Ordering::SeqCst) == 1));
}

#[test]
fn forall_over_a_list() {
    let runtime = runtime(3, OrderedExecutorKind::Ordered);
    let words: Vec<String> = (0..20).map(|i| format!("w{}", i)).collect();
    let mapped = Mutex::new(vec![]);
    runtime
        .forall(
            &ListMapper::new(words.clone()).with_chunk_size(3),
            |word, _iteration| {
                mapped.lock().push(word);
                Ok(())
            },
        )
        .unwrap();
    let mut mapped = mapped.into_inner();
    mapped.sort();
    let mut expected = words;
    expected.sort();
    assert_eq!(mapped, expected);
}

#[test]
fn forall_accesses_take_no_locks() {
    let runtime = runtime(4, OrderedExecutorKind::Ordered);
    let cell = SharedCell::new(0u64);
    runtime
        .forall(&RangeMapper::new(1..101), |value, iteration| {
            assert_eq!(iteration.mask(), MethodFlag::NONE);
            cell.update(iteration, MethodFlag::ALL, |v| *v += value as u64)?;
            assert_eq!(iteration.num_owned_locks(), 0);
            Ok(())
        })
        .unwrap();
    assert_eq!(cell.get(), 5050);
    assert_none!(cell.owner());
}

#[test]
fn forall_failures_stop_the_map() {
    let runtime = runtime(2, OrderedExecutorKind::Ordered);
    let result = runtime.forall(&RangeMapper::new(0..100), |index, _iteration| {
        if index == 42 {
            return Err(anyhow!("index {} is poisoned", index).into());
        }
        Ok(())
    });
    assert_matches!(result, Err(ExecutionError::UserError(e)) if e.to_string().contains("poisoned"));

    let result = runtime.forall(&RangeMapper::new(0..10), |index, _iteration| {
        if index == 3 {
            panic!("kaboom");
        }
        Ok(())
    });
    assert_matches!(result, Err(ExecutionError::WorkerPanicked(msg)) if msg.contains("kaboom"));

    let result = runtime.forall(&RangeMapper::new(0..10), |_index, _iteration| {
        Err(IterationError::Abort)
    });
    assert_matches!(result, Err(ExecutionError::InvariantViolation(_)));
}

#[test]
fn serial_forall_uses_the_calling_thread() {
    let runtime = Runtime::new(RuntimeConfig {
        serial: true,
        ..RuntimeConfig::with_threads(4)
    })
    .unwrap();
    let caller = thread::current().id();
    let order = Mutex::new(vec![]);
    let stats = runtime
        .forall(&RangeMapper::new(0..8).with_chunk_size(3), |index, _iteration| {
            assert_eq!(thread::current().id(), caller);
            order.lock().push(index);
            Ok(())
        })
        .unwrap();
    assert_eq!(stats.threads.len(), 1);
    assert_eq!(order.into_inner(), (0..8).collect::<Vec<_>>());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn unordered_matches_serial_sum(items in vec(0u64..1000, 0..200), threads in 1usize..4) {
        let runtime = runtime(threads, OrderedExecutorKind::Ordered);
        let cells: Vec<SharedCell<u64>> = (0..3).map(|_| SharedCell::new(0)).collect();
        let stats = runtime
            .foreach(fifo_of(items.clone()), |item, ctx| {
                cells[(*item % 3) as usize].update(ctx.iteration(), MethodFlag::ALL, |v| *v += *item)?;
                Ok(())
            })
            .unwrap();
        prop_assert_eq!(stats.committed(), items.len() as u64);
        for (residue, cell) in cells.iter().enumerate() {
            let expected: u64 = items.iter().filter(|x| (**x % 3) as usize == residue).sum();
            prop_assert_eq!(cell.get(), expected);
        }
    }

    #[test]
    fn ordered_commits_are_sorted(items in vec(0u32..50, 0..60), v2 in any::<bool>()) {
        let executor = if v2 { OrderedExecutorKind::OrderedV2 } else { OrderedExecutorKind::Ordered };
        let runtime = runtime(3, executor);
        let cell = SharedCell::new(0u32);
        let committed = Arc::new(Mutex::new(vec![]));
        runtime
            .foreach_ordered(ordered_of(items.clone()), |item, ctx| {
                cell.update(ctx.iteration(), MethodFlag::ALL, |v| *v += 1)?;
                let committed = committed.clone();
                let item = *item;
                ctx.iteration().on_commit(move || committed.lock().push(item));
                Ok(())
            })
            .unwrap();
        let mut expected = items.clone();
        expected.sort();
        prop_assert_eq!(committed.lock().clone(), expected);
        prop_assert_eq!(cell.get() as usize, items.len());
    }
}
