// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{ConfigError, OrderedExecutorKind, RuntimeConfig},
    context::ForeachContext,
    errors::{ExecutionError, ExecutionResult, IterationResult},
    executor::{
        OrderedExecutor, OrderedV2Executor, PmapExecutor, SerialExecutor, UnorderedExecutor,
    },
    iteration::Iteration,
    mappable::Mappable,
    process::IterationStatistics,
};
use amorph_worklist::{initial_work_distribution, OrderedWorklist, Worklist};
use rayon::ThreadPool;
use std::sync::Arc;
use tracing::info;

/// Entry point for foreach loops: owns the worker pool and dispatches every loop to the
/// executor selected by the configuration.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    thread_pool: Arc<ThreadPool>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.sanitize()?;
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|index| format!("amorph-worker-{}", index))
            .build()
            .map_err(|error| ConfigError::ThreadPool(error.to_string()))?;
        info!(
            "[Amorph]: runtime started with {} threads (serial: {}, ordered executor: {:?})",
            config.threads, config.serial, config.executor
        );
        Ok(Self {
            config,
            thread_pool: Arc::new(thread_pool),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.config.threads
    }

    /// Runs `body` on every item of `worklist`, and on every item added while running, in any
    /// order.
    pub fn foreach<T, W, F>(&self, worklist: Arc<W>, body: F) -> ExecutionResult<IterationStatistics>
    where
        T: Send,
        W: Worklist<T>,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        if self.config.serial {
            return SerialExecutor::new().call(body, worklist);
        }
        UnorderedExecutor::new(&self.config, self.thread_pool.clone()).call(body, worklist)
    }

    /// Seeds `worklist` with `initial`, spreading the items over the worker threads, then runs
    /// [`Runtime::foreach`].
    pub fn foreach_initial<T, W, I, F>(
        &self,
        initial: I,
        worklist: Arc<W>,
        body: F,
    ) -> ExecutionResult<IterationStatistics>
    where
        T: Send,
        W: Worklist<T>,
        I: IntoIterator<Item = T>,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        initial_work_distribution(&*worklist, initial, self.config.threads)
            .map_err(|_| ExecutionError::WorklistRejected)?;
        self.foreach(worklist, body)
    }

    /// Like [`Runtime::foreach`], but iterations commit in the order of the worklist's
    /// comparator.
    pub fn foreach_ordered<T, W, F>(
        &self,
        worklist: Arc<W>,
        body: F,
    ) -> ExecutionResult<IterationStatistics>
    where
        T: Clone + Send + Sync + 'static,
        W: OrderedWorklist<T> + 'static,
        F: Fn(&T, &mut ForeachContext<'_, T>) -> IterationResult + Sync,
    {
        if self.config.serial {
            return SerialExecutor::new().call(body, worklist);
        }
        match self.config.executor {
            OrderedExecutorKind::Ordered => {
                OrderedExecutor::new(&self.config, self.thread_pool.clone()).call(body, worklist)
            },
            OrderedExecutorKind::OrderedV2 => {
                OrderedV2Executor::new(&self.config, self.thread_pool.clone()).call(body, worklist)
            },
        }
    }

    /// Runs `body` once on every item of `mappable`, in parallel and without speculation. The
    /// body cannot add work, and its shared object accesses take no locks.
    pub fn forall<M, F>(&self, mappable: &M, body: F) -> ExecutionResult<IterationStatistics>
    where
        M: Mappable,
        F: Fn(M::Item, &Iteration) -> IterationResult + Sync,
    {
        PmapExecutor::new(&self.config, self.thread_pool.clone()).call(mappable, body)
    }
}
