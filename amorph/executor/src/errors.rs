// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Outcome of a single speculative iteration other than a plain success. Returned by the loop
/// body and by [`crate::Lockable::access`], so conflicts unwind the body through `?`.
#[derive(Debug, Error)]
pub enum IterationError {
    /// The iteration lost a conflict and must be rolled back and retried.
    #[error("iteration aborted on conflict")]
    Abort,
    /// The body decided its item needs no processing. Handled like a commit.
    #[error("work item was not useful")]
    NotUseful,
    /// Unrecoverable error raised by the body. The iteration is rolled back and the whole
    /// execution stops with this error.
    #[error(transparent)]
    User(#[from] anyhow::Error),
}

pub type IterationResult<T = ()> = Result<T, IterationError>;

/// Errors that end a whole executor call.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Unrecoverable executor error, the internal state machine reached an impossible state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The loop body returned a user error.
    #[error("iteration body failed: {0}")]
    UserError(anyhow::Error),
    /// The loop body panicked.
    #[error("iteration body panicked: {0}")]
    WorkerPanicked(String),
    /// A committed iteration produced an item the worklist refused.
    #[error("worklist rejected a committed item")]
    WorklistRejected,
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Logs the message at error level and wraps it into [`ExecutionError::InvariantViolation`].
pub(crate) fn invariant_violation(msg: impl Into<String>) -> ExecutionError {
    let msg = msg.into();
    tracing::error!("[Amorph]: {}", msg);
    ExecutionError::InvariantViolation(msg)
}
