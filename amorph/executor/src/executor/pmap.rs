// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{panic_message, serial::NoArbitration, RoundControl};
use crate::{
    config::RuntimeConfig,
    counters,
    errors::{invariant_violation, ExecutionError, ExecutionResult, IterationError, IterationResult},
    flags::MethodFlag,
    iteration::{Arbiter, Iteration, IterationStatus},
    mappable::{ChunkCursor, Mappable},
    process::{run_workers, IterationStatistics, StatsRecorder},
};
use rayon::ThreadPool;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::info;

const EXECUTOR: &str = "pmap";

/// Parallel map over a fixed collection. Nothing speculates: every iteration runs with mask
/// `NONE`, so lock acquisitions and undo logging are skipped and every item commits once.
pub struct PmapExecutor {
    num_threads: usize,
    serial: bool,
    thread_pool: Arc<ThreadPool>,
}

impl PmapExecutor {
    pub fn new(config: &RuntimeConfig, thread_pool: Arc<ThreadPool>) -> Self {
        assert!(
            config.threads > 0 && config.threads <= thread_pool.current_num_threads(),
            "[Amorph]: invalid number of threads {}",
            config.threads
        );
        Self {
            num_threads: if config.serial { 1 } else { config.threads },
            serial: config.serial,
            thread_pool,
        }
    }

    pub fn call<M, F>(&self, mappable: &M, body: F) -> ExecutionResult<IterationStatistics>
    where
        M: Mappable,
        F: Fn(M::Item, &Iteration) -> IterationResult + Sync,
    {
        let _timer = counters::CALL_SECONDS
            .with_label_values(&[EXECUTOR])
            .start_timer();
        let arbiter: Arc<dyn Arbiter> = Arc::new(NoArbitration);
        let stats = StatsRecorder::new(EXECUTOR, self.num_threads);
        let control = RoundControl::default();
        let chunk_size = mappable
            .chunk_size()
            .unwrap_or(2 * self.num_threads)
            .max(1);
        let cursor = ChunkCursor::new(mappable.len(), chunk_size);
        info!(
            "[Amorph]: forall over {} items on {} threads, chunks of {}",
            mappable.len(),
            self.num_threads,
            chunk_size
        );
        stats.round();

        let worker = |thread_id: usize| {
            let iteration = Iteration::new(thread_id, MethodFlag::NONE, Arc::downgrade(&arbiter));
            iteration.set_thread_id(thread_id);
            'chunks: while let Some(chunk) = cursor.next_chunk() {
                for index in chunk {
                    if control.stopping() {
                        break 'chunks;
                    }
                    match run_item(&body, mappable.item(index), &iteration) {
                        Ok(()) => stats.committed(thread_id),
                        Err(error) => {
                            control.fail(error);
                            break 'chunks;
                        },
                    }
                }
            }
        };
        if self.serial {
            worker(0);
        } else {
            run_workers(&self.thread_pool, self.num_threads, worker);
        }

        control.end_round()?;
        Ok(stats.snapshot())
    }
}

/// Runs one item to completion. Commit and undo logs still run, so objects that register
/// actions unconditionally behave the same as under the speculative executors.
fn run_item<I, F>(body: &F, item: I, iteration: &Iteration) -> ExecutionResult<()>
where
    F: Fn(I, &Iteration) -> IterationResult,
{
    iteration.set_status(IterationStatus::Scheduled);
    let result = panic::catch_unwind(AssertUnwindSafe(|| body(item, iteration)));
    let outcome = match result {
        Ok(Ok(())) | Ok(Err(IterationError::NotUseful)) => {
            iteration.perform_commit();
            iteration.retire(IterationStatus::CommitDone);
            Ok(())
        },
        Ok(Err(failure)) => {
            iteration.perform_abort();
            iteration.retire(IterationStatus::AbortDone);
            Err(match failure {
                IterationError::User(error) => ExecutionError::UserError(error),
                _ => invariant_violation("forall iteration aborted without speculation"),
            })
        },
        Err(payload) => {
            iteration.perform_abort();
            iteration.retire(IterationStatus::AbortDone);
            Err(ExecutionError::WorkerPanicked(panic_message(
                payload.as_ref(),
            )))
        },
    };
    iteration.reset();
    outcome
}
