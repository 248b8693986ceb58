// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{reinsert, run_body, BodyOutcome, RoundControl};
use crate::{
    config::RuntimeConfig,
    context::{ForeachContext, IterationOutputs},
    counters,
    errors::{ExecutionError, ExecutionResult, IterationError, IterationResult},
    flags::MethodFlag,
    iteration::{Arbiter, Iteration, IterationId, IterationStatus},
    process::{run_workers, Backoff, Idle, IterationStatistics, StatsRecorder, Termination},
};
use amorph_worklist::{ThreadCtx, Worklist};
use rayon::ThreadPool;
use std::{
    sync::{Arc, Weak},
    time::Instant,
};
use tracing::{debug, info};

const EXECUTOR: &str = "unordered";

/// Without an order to respect, the iteration that finds a lock taken always gives up.
struct AbortOnConflict;

impl Arbiter for AbortOnConflict {
    fn arbitrate(&self, _current: &Iteration, _owner: IterationId) -> IterationResult {
        Err(IterationError::Abort)
    }
}

/// Speculative foreach without ordering: items commit in whatever order their iterations
/// finish.
pub struct UnorderedExecutor {
    num_threads: usize,
    backoff: bool,
    thread_pool: Arc<ThreadPool>,
}

struct Round<'a, W> {
    worklist: &'a W,
    termination: Termination,
    control: RoundControl,
    stats: &'a StatsRecorder,
}

impl UnorderedExecutor {
    pub fn new(config: &RuntimeConfig, thread_pool: Arc<ThreadPool>) -> Self {
        assert!(
            config.threads > 0 && config.threads <= thread_pool.current_num_threads(),
            "[Amorph]: invalid number of threads {}",
            config.threads
        );
        Self {
            num_threads: config.threads,
            backoff: config.backoff,
            thread_pool,
        }
    }

    pub fn call<T, W, F>(&self, body: F, worklist: Arc<W>) -> ExecutionResult<IterationStatistics>
    where
        T: Send,
        W: Worklist<T>,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        let _timer = counters::CALL_SECONDS
            .with_label_values(&[EXECUTOR])
            .start_timer();
        let arbiter: Arc<dyn Arbiter> = Arc::new(AbortOnConflict);
        let arbiter = Arc::downgrade(&arbiter);
        let stats = StatsRecorder::new(EXECUTOR, self.num_threads);
        info!(
            "[Amorph]: unordered foreach over {} items on {} threads",
            worklist.size(),
            self.num_threads
        );

        loop {
            stats.round();
            let round = Round {
                worklist: &*worklist,
                termination: Termination::new(self.num_threads),
                control: RoundControl::default(),
                stats: &stats,
            };
            run_workers(&self.thread_pool, self.num_threads, |thread_id| {
                self.worker_loop(thread_id, &round, &body, &arbiter)
            });
            if !round.control.end_round()? {
                break;
            }
            debug!("[Amorph]: restarting unordered round after suspension");
        }

        Ok(stats.snapshot())
    }

    fn worker_loop<T, W, F>(
        &self,
        thread_id: usize,
        round: &Round<'_, W>,
        body: &F,
        arbiter: &Weak<dyn Arbiter>,
    ) where
        T: Send,
        W: Worklist<T>,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        let _guard = scopeguard::guard_on_unwind((), |_| round.termination.stop());
        let thread = ThreadCtx::new(thread_id);
        let iteration = Iteration::new(thread_id, MethodFlag::ALL, arbiter.clone());
        iteration.set_thread_id(thread_id);
        let mut backoff = Backoff::new(self.backoff);

        while !round.termination.is_done() {
            let item = match round.worklist.poll(thread) {
                Some(item) => item,
                None => {
                    let start = Instant::now();
                    let outcome = round.termination.idle(|| round.worklist.polls());
                    round.stats.idle(thread_id, start.elapsed());
                    match outcome {
                        Idle::Work(item) => item,
                        Idle::Retry => continue,
                        Idle::Done => break,
                    }
                },
            };

            iteration.set_status(IterationStatus::Scheduled);
            let worklist: &dyn Worklist<T> = round.worklist;
            let mut ctx = ForeachContext::new(&iteration, Some(worklist), thread);
            match run_body(body, &item, &mut ctx) {
                BodyOutcome::Commit => {
                    let outputs = ctx.into_outputs();
                    self.publish(round, outputs, thread);
                    iteration.perform_commit();
                    iteration.retire(IterationStatus::CommitDone);
                    round.stats.committed(thread_id);
                    backoff.committed();
                },
                BodyOutcome::Abort => {
                    drop(ctx);
                    iteration.set_status(IterationStatus::Aborting);
                    iteration.perform_abort();
                    reinsert(round.worklist, item, thread);
                    round.termination.work_added();
                    iteration.retire(IterationStatus::AbortDone);
                    round.stats.aborted(thread_id);
                    backoff.aborted(|d| round.termination.sleep(d));
                },
                BodyOutcome::Failed(error) => {
                    drop(ctx);
                    iteration.set_status(IterationStatus::Aborting);
                    iteration.perform_abort();
                    iteration.retire(IterationStatus::AbortDone);
                    round.stats.aborted(thread_id);
                    round.control.fail(error);
                    round.termination.stop();
                },
            }
            iteration.reset();
        }
    }

    fn publish<T, W>(&self, round: &Round<'_, W>, outputs: IterationOutputs<T>, thread: ThreadCtx)
    where
        W: Worklist<T>,
    {
        let added = !outputs.items.is_empty();
        for item in outputs.items {
            if round.worklist.add(item, thread).is_err() {
                round.control.fail(ExecutionError::WorklistRejected);
                round.termination.stop();
                return;
            }
        }
        if added {
            round.termination.work_added();
        }
        if round.control.committed(outputs.finish, outputs.suspend) {
            round.termination.stop();
        }
    }
}
