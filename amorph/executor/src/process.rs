// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Worker threads and the bookkeeping shared by all executors: termination detection, abort
//! backoff and per-thread statistics.

use crate::counters;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use serde::Serialize;
use std::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

// Idle workers re-poll at this interval even without a wakeup.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);
const BACKOFF_LOG_FACTOR: u32 = 4;
const BACKOFF_MASK: u64 = (1 << BACKOFF_LOG_FACTOR) - 1;

/// Runs `worker(thread_id)` once on each of `num_threads` threads of `thread_pool` and returns
/// after all of them finished.
pub(crate) fn run_workers<F>(thread_pool: &ThreadPool, num_threads: usize, worker: F)
where
    F: Fn(usize) + Sync,
{
    assert!(
        thread_pool.current_num_threads() >= num_threads,
        "[Amorph]: thread pool has {} threads, {} workers requested",
        thread_pool.current_num_threads(),
        num_threads
    );
    let worker = &worker;
    thread_pool.scope(|s| {
        for thread_id in 0..num_threads {
            s.spawn(move |_| worker(thread_id));
        }
    });
}

#[derive(Debug)]
pub(crate) enum Idle<R> {
    /// The serial check found more work.
    Work(R),
    /// Woken up or timed out, poll again.
    Retry,
    /// The round is over.
    Done,
}

struct TerminationState {
    idle: usize,
    done: bool,
}

/// Detects that every worker ran out of work, and broadcasts early stops.
pub(crate) struct Termination {
    num_threads: usize,
    state: Mutex<TerminationState>,
    wakeup: Condvar,
    backoff: Condvar,
    done: AtomicBool,
    sleepers: AtomicUsize,
}

impl Termination {
    pub(crate) fn new(num_threads: usize) -> Self {
        Self {
            num_threads,
            state: Mutex::new(TerminationState {
                idle: 0,
                done: false,
            }),
            wakeup: Condvar::new(),
            backoff: Condvar::new(),
            done: AtomicBool::new(false),
            sleepers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Ends the round for everyone: idle workers return `Idle::Done`, busy ones see
    /// `is_done()` after their current iteration.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.done.store(true, Ordering::Release);
        self.wakeup.notify_all();
        self.backoff.notify_all();
    }

    /// Called by a worker that found no work. The last worker to go idle runs `check`, a serial
    /// check for remaining work (every other worker is parked, so serial polls are safe).
    pub(crate) fn idle<R>(&self, check: impl FnOnce() -> Option<R>) -> Idle<R> {
        let mut state = self.state.lock();
        if state.done {
            return Idle::Done;
        }
        state.idle += 1;
        if state.idle == self.num_threads {
            if let Some(work) = check() {
                state.idle -= 1;
                return Idle::Work(work);
            }
            state.done = true;
            self.done.store(true, Ordering::Release);
            self.wakeup.notify_all();
            self.backoff.notify_all();
            return Idle::Done;
        }

        self.sleepers.fetch_add(1, Ordering::SeqCst);
        self.wakeup.wait_for(&mut state, IDLE_POLL_INTERVAL);
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        if state.done {
            return Idle::Done;
        }
        state.idle -= 1;
        Idle::Retry
    }

    /// Wakes one idle worker after new work was published.
    pub(crate) fn work_added(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            self.wakeup.notify_one();
        }
    }

    /// Sleeps for `duration`, or until the round stops.
    pub(crate) fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        if !state.done {
            self.backoff.wait_for(&mut state, duration);
        }
    }
}

/// Exponential backoff after consecutive aborts without an intervening commit.
pub(crate) struct Backoff {
    enabled: bool,
    consecutive_aborts: u64,
}

impl Backoff {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            consecutive_aborts: 0,
        }
    }

    pub(crate) fn committed(&mut self) {
        self.consecutive_aborts = 0;
    }

    /// Every 16th consecutive abort calls `sleep` with `consecutive >> 4` milliseconds.
    pub(crate) fn aborted(&mut self, sleep: impl FnOnce(Duration)) {
        self.consecutive_aborts += 1;
        if let Some(duration) = self.pending_sleep() {
            sleep(duration);
        }
    }

    fn pending_sleep(&self) -> Option<Duration> {
        let consec = self.consecutive_aborts;
        (self.enabled && consec > 1 && consec & BACKOFF_MASK == 0)
            .then(|| Duration::from_millis(consec >> BACKOFF_LOG_FACTOR))
    }
}

/// A condition that is re-checked by its waiters, with a counter to avoid lost wakeups.
pub(crate) struct Signal {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Snapshot to be taken before checking the condition.
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.cv.notify_all();
    }

    /// Waits for a notification after the `seen` snapshot, at most `timeout`.
    pub(crate) fn wait_since(&self, seen: u64, timeout: Duration) {
        let mut epoch = self.epoch.lock();
        if *epoch == seen {
            self.cv.wait_for(&mut epoch, timeout);
        }
    }
}

/// Outcome counts of the iterations run by one worker thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ThreadStatistics {
    pub committed: u64,
    pub aborted: u64,
    pub idle_time: Duration,
}

/// Statistics of a whole executor call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IterationStatistics {
    pub threads: Vec<ThreadStatistics>,
    /// Number of rounds, more than one when iterations suspended the loop.
    pub rounds: usize,
}

impl IterationStatistics {
    pub fn committed(&self) -> u64 {
        self.threads.iter().map(|t| t.committed).sum()
    }

    pub fn aborted(&self) -> u64 {
        self.threads.iter().map(|t| t.aborted).sum()
    }

    pub fn iterations(&self) -> u64 {
        self.committed() + self.aborted()
    }

    pub fn abort_ratio(&self) -> f64 {
        match self.iterations() {
            0 => 0.0,
            total => self.aborted() as f64 / total as f64,
        }
    }
}

#[derive(Default)]
struct ThreadCounters {
    committed: AtomicU64,
    aborted: AtomicU64,
    idle_nanos: AtomicU64,
}

/// Collects statistics from all workers of a call and mirrors them into the prometheus
/// counters under the executor's label.
pub(crate) struct StatsRecorder {
    executor: &'static str,
    threads: Vec<CachePadded<ThreadCounters>>,
    rounds: AtomicUsize,
}

impl StatsRecorder {
    pub(crate) fn new(executor: &'static str, num_threads: usize) -> Self {
        Self {
            executor,
            threads: (0..num_threads)
                .map(|_| CachePadded::new(ThreadCounters::default()))
                .collect(),
            rounds: AtomicUsize::new(0),
        }
    }

    fn counters(&self, thread_id: usize) -> &ThreadCounters {
        &self.threads[thread_id % self.threads.len()]
    }

    pub(crate) fn committed(&self, thread_id: usize) {
        self.counters(thread_id)
            .committed
            .fetch_add(1, Ordering::Relaxed);
        counters::ITERATIONS
            .with_label_values(&[self.executor, "committed"])
            .inc();
    }

    pub(crate) fn aborted(&self, thread_id: usize) {
        self.counters(thread_id).aborted.fetch_add(1, Ordering::Relaxed);
        counters::ITERATIONS
            .with_label_values(&[self.executor, "aborted"])
            .inc();
    }

    pub(crate) fn idle(&self, thread_id: usize, duration: Duration) {
        self.counters(thread_id)
            .idle_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> IterationStatistics {
        IterationStatistics {
            threads: self
                .threads
                .iter()
                .map(|t| ThreadStatistics {
                    committed: t.committed.load(Ordering::Relaxed),
                    aborted: t.aborted.load(Ordering::Relaxed),
                    idle_time: Duration::from_nanos(t.idle_nanos.load(Ordering::Relaxed)),
                })
                .collect(),
            rounds: self.rounds.load(Ordering::Relaxed),
        }
    }
}
