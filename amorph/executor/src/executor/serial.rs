// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{reinsert, run_body, BodyOutcome};
use crate::{
    context::ForeachContext,
    counters,
    errors::{ExecutionError, ExecutionResult, IterationError, IterationResult},
    flags::MethodFlag,
    iteration::{Arbiter, Iteration, IterationId, IterationStatus},
    process::{IterationStatistics, StatsRecorder},
};
use amorph_worklist::{ThreadCtx, Worklist};
use std::sync::Arc;
use tracing::debug;

const EXECUTOR: &str = "serial";

// Accesses are masked out, so nothing ever arbitrates.
pub(super) struct NoArbitration;

impl Arbiter for NoArbitration {
    fn arbitrate(&self, _current: &Iteration, _owner: IterationId) -> IterationResult {
        Err(IterationError::Abort)
    }
}

/// Runs the loop on the calling thread, draining the worklist with serial polls. Shared object
/// accesses are no-ops and new items are visible immediately, so an ordered worklist yields
/// the same commit order as the ordered executors.
#[derive(Default)]
pub struct SerialExecutor;

impl SerialExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn call<T, W, F>(&self, body: F, worklist: Arc<W>) -> ExecutionResult<IterationStatistics>
    where
        W: Worklist<T>,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult,
    {
        let _timer = counters::CALL_SECONDS
            .with_label_values(&[EXECUTOR])
            .start_timer();
        let arbiter: Arc<dyn Arbiter> = Arc::new(NoArbitration);
        let iteration = Iteration::new(0, MethodFlag::NONE, Arc::downgrade(&arbiter));
        let stats = StatsRecorder::new(EXECUTOR, 1);
        let thread = ThreadCtx::new(0);
        stats.round();

        while let Some(item) = worklist.polls() {
            iteration.set_status(IterationStatus::Scheduled);
            let target: &dyn Worklist<T> = &*worklist;
            let mut ctx = ForeachContext::new(&iteration, Some(target), thread);
            match run_body(&body, &item, &mut ctx) {
                BodyOutcome::Commit => {
                    let outputs = ctx.into_outputs();
                    for new_item in outputs.items {
                        worklist
                            .add(new_item, thread)
                            .map_err(|_| ExecutionError::WorklistRejected)?;
                    }
                    iteration.perform_commit();
                    iteration.retire(IterationStatus::CommitDone);
                    iteration.reset();
                    stats.committed(0);
                    for thunk in outputs.suspend {
                        thunk();
                    }
                    if outputs.finish {
                        debug!("[Amorph]: serial foreach finished early");
                        break;
                    }
                },
                BodyOutcome::Abort => {
                    drop(ctx);
                    iteration.perform_abort();
                    iteration.retire(IterationStatus::AbortDone);
                    iteration.reset();
                    reinsert(&*worklist, item, thread);
                    stats.aborted(0);
                },
                BodyOutcome::Failed(error) => {
                    drop(ctx);
                    iteration.perform_abort();
                    iteration.retire(IterationStatus::AbortDone);
                    iteration.reset();
                    return Err(error);
                },
            }
        }

        Ok(stats.snapshot())
    }
}
