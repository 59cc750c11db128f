// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Work items and the per-worker queues holding them.

use super::task_group::GroupState;
use crate::macros::{log_error, log_trace};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// Type-erased body of a work item. Returning `false` marks the owning group
/// as failed.
pub(crate) type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

/// A submitted unit of work, tagged with the group that owns it.
pub(crate) struct WorkItem {
    /// Bookkeeping of the owning task group.
    group: Arc<GroupState>,
    /// Function to run.
    job: Job,
}

impl WorkItem {
    pub(crate) fn new(group: Arc<GroupState>, job: Job) -> Self {
        Self { group, job }
    }

    /// Runs this item, unless its group already failed with the
    /// stop-after-error policy, and records the outcome on the group.
    ///
    /// The item is consumed either way. This returns the owning group so that
    /// the caller can account for the completion.
    pub(crate) fn run(self) -> Arc<GroupState> {
        let WorkItem { group, job } = self;
        if group.should_skip() {
            log_trace!("Skipping a work item of a failed group");
            drop(job);
        } else {
            // A panic counts as a failure, so that the group still completes.
            let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                log_error!("A work item panicked, marking its group as failed");
                false
            });
            group.record(result);
        }
        group
    }
}

/// FIFO of work items owned by one worker thread.
///
/// The queue is only ever mutated under its own mutex, and the lock is never
/// held while an item runs.
pub(crate) struct WorkerQueue {
    /// Index of this queue in the scheduler.
    index: usize,
    /// Pending items.
    items: Mutex<VecDeque<WorkItem>>,
}

impl WorkerQueue {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Pushes an item, blocking until the lock is acquired.
    pub(crate) fn push(&self, item: WorkItem) {
        self.items.lock().unwrap().push_back(item);
    }

    /// Pushes an item if the lock can be acquired without blocking, otherwise
    /// gives the item back.
    pub(crate) fn try_push(&self, item: WorkItem) -> Result<(), WorkItem> {
        match self.try_lock() {
            Some(mut items) => {
                items.push_back(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Pops the front item if the lock can be acquired without blocking.
    pub(crate) fn try_pop(&self) -> Option<WorkItem> {
        self.try_lock()?.pop_front()
    }

    /// Number of items currently in this queue.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, VecDeque<WorkItem>>> {
        match self.items.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => {
                panic!("Worker queue #{} was poisoned: {e}", self.index)
            }
        }
    }
}
