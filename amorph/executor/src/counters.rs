// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

/// Count of iterations by executor and outcome (committed or aborted).
pub static ITERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "amorph_executor_iterations",
        "Number of speculative iterations by executor and outcome",
        &["executor", "outcome"]
    )
    .unwrap()
});

/// Count of abstract lock acquisitions that found the lock owned by another iteration.
pub static CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "amorph_executor_conflicts",
        "Number of abstract lock conflicts"
    )
    .unwrap()
});

/// Count of times an iteration blocked on the retirement of a conflicting iteration.
pub static ARBITRATION_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "amorph_executor_arbitration_waits",
        "Number of arbitration decisions that waited on the conflicting iteration"
    )
    .unwrap()
});

/// Count of re-insertions refused by the worklist, each retried until accepted.
pub static ADD_ABORTED_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "amorph_executor_add_aborted_retries",
        "Number of rejected re-insertions of aborted work items"
    )
    .unwrap()
});

pub static CALL_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "amorph_executor_call_seconds",
        "Wall time of an executor call",
        &["executor"]
    )
    .unwrap()
});
