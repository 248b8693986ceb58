// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

mod ordered;
mod ordered_v2;
mod pmap;
mod reorder_buffer;
mod serial;
mod unordered;

pub use ordered::OrderedExecutor;
pub use ordered_v2::OrderedV2Executor;
pub use pmap::PmapExecutor;
pub use serial::SerialExecutor;
pub use unordered::UnorderedExecutor;

use crate::{
    context::{ForeachContext, Thunk},
    counters,
    errors::{ExecutionError, ExecutionResult, IterationError, IterationResult},
};
use amorph_worklist::{Rejected, ThreadCtx, Worklist};
use parking_lot::Mutex;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::debug;

pub(crate) enum BodyOutcome {
    Commit,
    Abort,
    Failed(ExecutionError),
}

/// Runs the loop body on `item`, turning a panic into a fatal error.
pub(crate) fn run_body<T, F>(body: &F, item: &T, ctx: &mut ForeachContext<'_, T>) -> BodyOutcome
where
    F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult,
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(item, ctx))) {
        Ok(Ok(())) | Ok(Err(IterationError::NotUseful)) => BodyOutcome::Commit,
        Ok(Err(IterationError::Abort)) => BodyOutcome::Abort,
        Ok(Err(IterationError::User(error))) => {
            BodyOutcome::Failed(ExecutionError::UserError(error))
        },
        Err(payload) => BodyOutcome::Failed(ExecutionError::WorkerPanicked(panic_message(
            payload.as_ref(),
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Puts the item of an aborted iteration back, retrying while the worklist refuses it.
pub(crate) fn reinsert<T, W>(worklist: &W, mut item: T, ctx: ThreadCtx)
where
    W: Worklist<T> + ?Sized,
{
    loop {
        match worklist.add_aborted(item, ctx) {
            Ok(()) => return,
            Err(Rejected(rejected)) => {
                counters::ADD_ABORTED_RETRIES.inc();
                item = rejected;
                std::thread::yield_now();
            },
        }
    }
}

/// Early exits of a round: committed `finish` and `suspend_with` requests, and the first fatal
/// error.
#[derive(Default)]
pub(crate) struct RoundControl {
    finish: AtomicBool,
    suspended: AtomicBool,
    thunks: Mutex<Vec<Thunk>>,
    error: Mutex<Option<ExecutionError>>,
    failed: AtomicBool,
}

impl RoundControl {
    /// Records the control effects of a committed iteration. Returns whether the round must
    /// stop.
    pub(crate) fn committed(&self, finish: bool, suspend: Vec<Thunk>) -> bool {
        let mut stop = false;
        if !suspend.is_empty() {
            self.thunks.lock().extend(suspend);
            self.suspended.store(true, Ordering::SeqCst);
            stop = true;
        }
        if finish {
            self.finish.store(true, Ordering::SeqCst);
            stop = true;
        }
        stop
    }

    /// Keeps the first error, later ones are only logged.
    pub(crate) fn fail(&self, error: ExecutionError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
            self.failed.store(true, Ordering::SeqCst);
        } else {
            debug!("[Amorph]: dropping error after the first failure: {}", error);
        }
    }

    pub(crate) fn stopping(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
            || self.finish.load(Ordering::SeqCst)
            || self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn finished(&self) -> bool {
        self.finish.load(Ordering::SeqCst)
    }

    /// Called once all workers of the round returned. Runs pending thunks and returns whether
    /// another round should start.
    pub(crate) fn end_round(&self) -> ExecutionResult<bool> {
        if let Some(error) = self.error.lock().take() {
            return Err(error);
        }
        let thunks = std::mem::take(&mut *self.thunks.lock());
        for thunk in thunks {
            thunk();
        }
        Ok(self.suspended.load(Ordering::SeqCst) && !self.finished())
    }
}
