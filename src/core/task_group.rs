// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Groups of work items submitted to a scheduler and awaited together.

use super::queue::WorkItem;
use super::scheduler::{Scheduler, SchedulerBuilder};
use super::util::ThreadCount;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bookkeeping of a task group, shared with its queued work items.
pub(crate) struct GroupState {
    /// Number of items submitted and not yet completed (or skipped).
    remaining: CachePadded<AtomicUsize>,
    /// Whether all the items that ran so far succeeded.
    success: AtomicBool,
    /// Whether to skip the remaining items once one of them failed.
    stop_after_error: bool,
}

impl GroupState {
    pub(crate) fn new(stop_after_error: bool) -> Self {
        Self {
            remaining: CachePadded::new(AtomicUsize::new(0)),
            success: AtomicBool::new(true),
            stop_after_error,
        }
    }

    /// Accounts for a new item. This must happen before the item becomes
    /// visible to any worker.
    pub(crate) fn add_one(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    /// Accounts for a completed item. Returns true if this was the last
    /// outstanding item.
    pub(crate) fn finish_one(&self) -> bool {
        let remaining = self.remaining.fetch_sub(1, Ordering::SeqCst);
        assert!(remaining > 0);
        remaining == 1
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    pub(crate) fn success(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    /// Whether the next item should be dequeued without running.
    pub(crate) fn should_skip(&self) -> bool {
        self.stop_after_error && !self.success()
    }

    /// Records the result of an item. The first failure sticks.
    pub(crate) fn record(&self, result: bool) {
        if !result {
            self.success.store(false, Ordering::SeqCst);
        }
    }
}

/// A set of work items executed on a [`Scheduler`], whose completion is
/// awaited together.
///
/// Each item returns a boolean, and [`sync()`](Self::sync) returns whether
/// all of them succeeded. Dropping the group waits for all its items, so no
/// item outlives its group.
///
/// ```
/// # use tasklight::TaskGroup;
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// # use std::sync::Arc;
/// let sum = Arc::new(AtomicU64::new(0));
/// let group = TaskGroup::new(/* stop_after_error = */ false);
/// for i in 1..=10 {
///     let sum = sum.clone();
///     group.submit(move || {
///         sum.fetch_add(i, Ordering::Relaxed);
///         true
///     });
/// }
/// assert!(group.sync());
/// assert_eq!(sum.load(Ordering::Relaxed), 5 * 11);
/// ```
///
/// Groups can be nested: a group created with [`new()`](Self::new) from
/// within a running item reuses that item's scheduler, rather than spawning
/// more threads.
///
/// ```
/// # use tasklight::{TaskGroup, ThreadCount};
/// let outer = TaskGroup::with_threads(ThreadCount::try_from(2).unwrap(), false);
/// for _ in 0..4 {
///     outer.submit(|| {
///         let inner = TaskGroup::new(false);
///         assert_eq!(inner.num_workers(), 2);
///         for j in 0..4 {
///             inner.submit(move || j < 4);
///         }
///         inner.sync()
///     });
/// }
/// assert!(outer.sync());
/// ```
pub struct TaskGroup {
    /// Scheduler executing the items.
    scheduler: Scheduler,
    /// Bookkeeping shared with the queued items.
    state: Arc<GroupState>,
}

impl TaskGroup {
    /// Creates a group on the scheduler of the work item running on the
    /// calling thread, or on the [global](Scheduler::global) scheduler if
    /// the calling thread isn't running a work item.
    ///
    /// With `stop_after_error`, items that are dequeued after one item of the
    /// group failed are skipped.
    pub fn new(stop_after_error: bool) -> Self {
        let scheduler = Scheduler::current().unwrap_or_else(Scheduler::global);
        Self::on(&scheduler, stop_after_error)
    }

    /// Creates a group on a dedicated scheduler with the given number of
    /// threads.
    pub fn with_threads(num_threads: ThreadCount, stop_after_error: bool) -> Self {
        let scheduler = SchedulerBuilder {
            num_threads,
            ..Default::default()
        }
        .build();
        Self::on(&scheduler, stop_after_error)
    }

    /// Creates a group on the given scheduler.
    pub fn on(scheduler: &Scheduler, stop_after_error: bool) -> Self {
        scheduler.inner().register();
        Self {
            scheduler: scheduler.clone(),
            state: Arc::new(GroupState::new(stop_after_error)),
        }
    }

    /// Submits a work item. Returning `false` from it marks the group as
    /// failed.
    ///
    /// If the scheduler has too many pending items, this executes queued
    /// items on the calling thread before returning.
    pub fn submit(&self, f: impl FnOnce() -> bool + Send + 'static) {
        self.state.add_one();
        self.scheduler
            .inner()
            .submit(WorkItem::new(self.state.clone(), Box::new(f)));
    }

    /// Waits until all the submitted items have completed, and returns true if
    /// none of them failed.
    ///
    /// Rather than idling, the calling thread executes queued items of the
    /// scheduler in the meantime.
    pub fn sync(&self) -> bool {
        self.scheduler.inner().wait_group(&self.state)
    }

    /// Returns the number of worker threads of the scheduler.
    pub fn num_workers(&self) -> usize {
        self.scheduler.num_workers()
    }

    /// Returns the scheduler executing this group.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Returns the number of submitted items that haven't completed yet.
    pub fn remaining(&self) -> usize {
        self.state.remaining()
    }

    /// Returns whether items are skipped after the first failure.
    pub fn stop_after_error(&self) -> bool {
        self.state.stop_after_error
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("scheduler", &self.scheduler)
            .field("remaining", &self.state.remaining())
            .field("success", &self.state.success())
            .field("stop_after_error", &self.state.stop_after_error)
            .finish()
    }
}

impl Drop for TaskGroup {
    /// Waits for all the items, then detaches from the scheduler.
    fn drop(&mut self) {
        self.sync();
        self.scheduler.inner().unregister();
    }
}
