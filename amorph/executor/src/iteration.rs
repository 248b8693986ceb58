// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::{IterationError, IterationResult},
    flags::MethodFlag,
    lock::LockWord,
};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

pub type IterationId = usize;

type Action = Box<dyn FnOnce() + Send>;

// Re-checks the status of an iteration we wait on, so a missed wakeup costs a bounded delay.
const RETIRE_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// All possible statuses of an iteration.
///
/// 'Unscheduled' iterations sit in a free pool. Polling an item schedules the iteration, which
/// then runs the loop body. The unordered executor commits or aborts right after the body
/// returns; the ordered executors park the iteration as 'ReadyToCommit' until every iteration
/// of higher priority retired, so commits happen in priority order.
///
/// An iteration of higher priority may ask a running one to give up ('AbortSelf'), which the
/// running iteration honors at its next conflict or when its body returns. 'Committing' and
/// 'Aborting' are held by exactly one thread while it runs the commit or undo log. Every
/// iteration ends as 'CommitDone' or 'AbortDone' and is then reset to 'Unscheduled' for reuse.
///
/// Status transition diagram:
/// Unscheduled
///    |  poll (item assigned)
///    ↓               arbitration (higher priority conflicter)
/// Scheduled -------------------------------------------> AbortSelf
///    |      \                                               |
///    |       \ conflict / body abort                        |  next conflict / body returns
///    |        --------------------------------------------> Aborting ----> AbortDone
///    |  body returns                                        ↑
///    ↓              arbitration (higher priority conflicter)|
/// ReadyToCommit ---------------------------------------------
///    |
///    |  reached the head of the commit order
///    ↓
/// Committing ------------------------------------------> CommitDone
///
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IterationStatus {
    Unscheduled = 0,
    Scheduled = 1,
    ReadyToCommit = 2,
    Committing = 3,
    CommitDone = 4,
    Aborting = 5,
    AbortSelf = 6,
    AbortDone = 7,
}

impl IterationStatus {
    fn from_u8(value: u8) -> Self {
        use IterationStatus::*;
        match value {
            0 => Unscheduled,
            1 => Scheduled,
            2 => ReadyToCommit,
            3 => Committing,
            4 => CommitDone,
            5 => Aborting,
            6 => AbortSelf,
            _ => AbortDone,
        }
    }

    /// Retired iterations hold no abstract locks.
    pub fn is_retired(self) -> bool {
        matches!(
            self,
            IterationStatus::Unscheduled | IterationStatus::CommitDone | IterationStatus::AbortDone
        )
    }
}

/// Conflict resolution policy of an executor. Invoked when `current` finds an abstract lock
/// owned by the iteration `owner`.
pub trait Arbiter: Send + Sync {
    /// `Ok(())` means the lock acquisition should be retried (the owner retired or was told to
    /// abort). `Err(IterationError::Abort)` means `current` lost and must abort.
    fn arbitrate(&self, current: &Iteration, owner: IterationId) -> IterationResult;
}

#[derive(Default)]
struct IterationLogs {
    undo: Vec<Action>,
    commit: Vec<Action>,
    release: Vec<Action>,
    owned_locks: Vec<Arc<LockWord>>,
}

impl IterationLogs {
    fn is_empty(&self) -> bool {
        self.undo.is_empty()
            && self.commit.is_empty()
            && self.release.is_empty()
            && self.owned_locks.is_empty()
    }
}

/// A speculative execution of the loop body on one work item.
pub struct Iteration {
    id: IterationId,
    thread_id: AtomicUsize,
    status: AtomicU8,
    mask: MethodFlag,
    logs: Mutex<IterationLogs>,
    // Bumped every time the iteration retires, so that waiters can tell a retirement apart
    // from a later reuse of the same slot.
    retire_epoch: Mutex<u64>,
    retired: Condvar,
    arbiter: Weak<dyn Arbiter>,
}

impl Iteration {
    pub(crate) fn new(id: IterationId, mask: MethodFlag, arbiter: Weak<dyn Arbiter>) -> Self {
        Self {
            id,
            thread_id: AtomicUsize::new(0),
            status: AtomicU8::new(IterationStatus::Unscheduled as u8),
            mask,
            logs: Mutex::new(IterationLogs::default()),
            retire_epoch: Mutex::new(0),
            retired: Condvar::new(),
            arbiter,
        }
    }

    pub fn id(&self) -> IterationId {
        self.id
    }

    /// Worker thread currently (or last) running this iteration.
    pub fn thread_id(&self) -> usize {
        self.thread_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_thread_id(&self, thread_id: usize) {
        self.thread_id.store(thread_id, Ordering::Relaxed);
    }

    pub fn status(&self) -> IterationStatus {
        IterationStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: IterationStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Atomically moves from `from` to `to`, returning whether this caller made the transition.
    pub(crate) fn try_transition(&self, from: IterationStatus, to: IterationStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flags honored by accesses of this iteration.
    pub fn mask(&self) -> MethodFlag {
        self.mask
    }

    /// Registers an action run, in reverse registration order, if the iteration aborts.
    pub fn on_undo(&self, action: impl FnOnce() + Send + 'static) {
        self.logs.lock().undo.push(Box::new(action));
    }

    /// Registers an action run, in registration order, when the iteration commits.
    pub fn on_commit(&self, action: impl FnOnce() + Send + 'static) {
        self.logs.lock().commit.push(Box::new(action));
    }

    /// Registers an action run after the iteration released its locks, whatever the outcome.
    pub fn on_release(&self, action: impl FnOnce() + Send + 'static) {
        self.logs.lock().release.push(Box::new(action));
    }

    pub(crate) fn add_owned_lock(&self, word: Arc<LockWord>) {
        self.logs.lock().owned_locks.push(word);
    }

    pub fn num_owned_locks(&self) -> usize {
        self.logs.lock().owned_locks.len()
    }

    pub(crate) fn arbitrate(&self, owner: IterationId) -> IterationResult {
        match self.arbiter.upgrade() {
            Some(arbiter) => arbiter.arbitrate(self, owner),
            None => Err(IterationError::Abort),
        }
    }

    /// Runs the commit log, then releases every owned lock. Returns the number of released
    /// locks.
    pub(crate) fn perform_commit(&self) -> usize {
        let logs = std::mem::take(&mut *self.logs.lock());
        for action in logs.commit {
            action();
        }
        self.release(logs.owned_locks, logs.release)
    }

    /// Runs the undo log backwards, then releases every owned lock. The logs are drained under
    /// the log mutex, so a repeated or concurrent call finds nothing left to do.
    pub(crate) fn perform_abort(&self) -> usize {
        let logs = std::mem::take(&mut *self.logs.lock());
        for action in logs.undo.into_iter().rev() {
            action();
        }
        self.release(logs.owned_locks, logs.release)
    }

    fn release(&self, owned_locks: Vec<Arc<LockWord>>, release_log: Vec<Action>) -> usize {
        let count = owned_locks.len();
        for word in owned_locks {
            word.release(self.id);
        }
        for action in release_log {
            action();
        }
        count
    }

    /// Records the final status and wakes every iteration waiting for this one.
    pub(crate) fn retire(&self, status: IterationStatus) {
        debug_assert!(status.is_retired());
        self.set_status(status);
        let mut epoch = self.retire_epoch.lock();
        *epoch += 1;
        self.retired.notify_all();
    }

    pub(crate) fn retire_epoch(&self) -> u64 {
        *self.retire_epoch.lock()
    }

    /// Blocks until the iteration retired at least once after `seen` was read.
    pub(crate) fn wait_retired(&self, seen: u64) {
        let mut epoch = self.retire_epoch.lock();
        while *epoch == seen && !self.status().is_retired() {
            self.retired.wait_for(&mut epoch, RETIRE_WAIT_INTERVAL);
        }
    }

    /// Prepares a retired iteration for reuse.
    pub(crate) fn reset(&self) {
        let mut logs = self.logs.lock();
        debug_assert!(logs.is_empty(), "[Amorph]: reset of iteration with pending logs");
        *logs = IterationLogs::default();
        drop(logs);
        self.set_status(IterationStatus::Unscheduled);
    }
}

/// Registers `action` to run if `iteration` aborts.
pub fn on_undo(iteration: &Iteration, action: impl FnOnce() + Send + 'static) {
    iteration.on_undo(action)
}

/// Registers `action` to run when `iteration` commits.
pub fn on_commit(iteration: &Iteration, action: impl FnOnce() + Send + 'static) {
    iteration.on_commit(action)
}

/// Registers `action` to run once `iteration` released its locks.
pub fn on_release(iteration: &Iteration, action: impl FnOnce() + Send + 'static) {
    iteration.on_release(action)
}
