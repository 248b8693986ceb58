// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Speculative parallel execution of foreach loops over worklists.
//!
//! The loop body runs optimistically on many threads at once. Each run is an [`Iteration`]
//! that acquires per-object abstract locks through [`Lockable::access`], records undo actions
//! for the state it changes and defers its visible effects (new work items, `finish`,
//! `suspend_with`) until it commits. When two iterations touch the same object, the executor's
//! arbitration policy picks one to abort: the loser is rolled back by running its undo log in
//! reverse, and its item goes back to the worklist to be retried.
//!
//! Executors:
//! - [`UnorderedExecutor`]: no commit order, the iteration finding a lock taken aborts;
//! - [`OrderedExecutor`]: commits in worklist priority order through a shared reorder buffer;
//! - [`OrderedV2Executor`]: commits in priority order driven by a dedicated committer thread;
//! - [`SerialExecutor`]: single thread, no speculation;
//! - [`PmapExecutor`]: non-speculative map over a [`Mappable`], used by [`Runtime::forall`].
//!
//! [`Runtime`] owns the worker pool and picks the executor from a [`RuntimeConfig`].

mod config;
mod context;
pub mod counters;
mod errors;
mod executor;
mod flags;
mod iteration;
mod lock;
mod mappable;
mod process;
mod runtime;

#[cfg(test)]
mod unit_tests;

pub use crate::{
    config::{ConfigError, OrderedExecutorKind, RuntimeConfig},
    context::ForeachContext,
    errors::{ExecutionError, ExecutionResult, IterationError, IterationResult},
    executor::{
        OrderedExecutor, OrderedV2Executor, PmapExecutor, SerialExecutor, UnorderedExecutor,
    },
    flags::MethodFlag,
    iteration::{on_commit, on_release, on_undo, Iteration, IterationId, IterationStatus},
    lock::{AbstractLock, Counter, Lockable, SharedCell},
    mappable::{ListMapper, Mappable, RangeMapper},
    process::{IterationStatistics, ThreadStatistics},
    runtime::Runtime,
};
