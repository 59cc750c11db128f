// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of worker threads, each owning a queue of work items.

use super::queue::{WorkItem, WorkerQueue};
use super::task_group::GroupState;
use super::util::{CpuPinningPolicy, ThreadCount};
use crate::macros::{log_debug, log_error, log_trace};
use crossbeam_utils::{Backoff, CachePadded};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

/// Default number of queued items above which submitters start executing
/// items themselves.
pub const DEFAULT_PENDING_LIMIT: usize = 4096;

/// Number of probes per worker queue in one draining scan.
const PROBES_PER_WORKER: usize = 12;

/// A scheduler and the index of a queue in it.
type Frame = (Arc<SchedulerInner>, usize);

thread_local! {
    /// Scheduler and queue index of the worker running on this thread, if any.
    static WORKER: RefCell<Option<Frame>> = const { RefCell::new(None) };
    /// Queues drained by this thread, innermost last: the worker's own queue,
    /// then one frame per nested wait or backpressure drain.
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    /// Schedulers of the work items running on this thread, innermost last.
    static RUNNING: RefCell<Vec<Arc<SchedulerInner>>> = const { RefCell::new(Vec::new()) };
    /// Work item on whose behalf this thread runs, if it runs a fiber body
    /// driven from another thread.
    static INHERITED: RefCell<Option<ItemContext>> = const { RefCell::new(None) };
    /// Source of randomness to pick a queue on submission.
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// The process-wide scheduler, created on first use and never torn down.
static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// A builder for [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerBuilder {
    /// Number of worker threads (and queues) of the scheduler.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Number of queued items at which a submitting thread starts draining
    /// the queues itself before returning.
    pub pending_limit: usize,
    /// How long an idle worker waits for work before re-checking whether it
    /// should exit.
    pub idle_timeout: Duration,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
            pending_limit: DEFAULT_PENDING_LIMIT,
            idle_timeout: Duration::from_millis(100),
        }
    }
}

impl SchedulerBuilder {
    /// Creates a scheduler.
    ///
    /// No thread is spawned until a [`TaskGroup`](crate::TaskGroup) is
    /// attached to the scheduler.
    ///
    /// ```
    /// # use tasklight::{CpuPinningPolicy, SchedulerBuilder, TaskGroup, ThreadCount};
    /// # use std::time::Duration;
    /// let scheduler = SchedulerBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     pending_limit: 1024,
    ///     idle_timeout: Duration::from_millis(50),
    /// }
    /// .build();
    /// assert_eq!(scheduler.num_workers(), 4);
    ///
    /// let group = TaskGroup::on(&scheduler, /* stop_after_error = */ false);
    /// for i in 0..100 {
    ///     group.submit(move || i < 1000);
    /// }
    /// assert!(group.sync());
    /// ```
    pub fn build(&self) -> Scheduler {
        Scheduler {
            inner: Arc::new(SchedulerInner::new(self)),
        }
    }
}

/// A fixed-size pool of worker threads, shared by one or more
/// [`TaskGroup`](crate::TaskGroup)s.
///
/// This is a cheap handle: clones refer to the same pool, and compare equal.
/// The pool is released once the last handle, task group and worker thread
/// are gone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Returns the process-wide default scheduler, sized to the number of
    /// available CPU cores.
    ///
    /// This scheduler is created on first use and is never torn down. Its
    /// worker threads only run while at least one task group uses it.
    pub fn global() -> Scheduler {
        GLOBAL
            .get_or_init(|| SchedulerBuilder::default().build())
            .clone()
    }

    /// Returns the scheduler of the innermost work item running on the
    /// calling thread, if any.
    pub fn current() -> Option<Scheduler> {
        current_running().map(|inner| Scheduler { inner })
    }

    /// Returns the number of worker threads (and queues) of this scheduler.
    pub fn num_workers(&self) -> usize {
        self.inner.queues.len()
    }

    pub(crate) fn inner(&self) -> &Arc<SchedulerInner> {
        &self.inner
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scheduler {}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.num_workers())
            .field("pending", &self.inner.pending())
            .finish()
    }
}

/// Pool metadata, protected by the scheduler-wide mutex.
struct PoolState {
    /// Number of task groups currently attached to the scheduler.
    registered_groups: usize,
    /// Whether a worker thread is running for each queue.
    live_workers: Vec<bool>,
}

/// Shared state of a scheduler.
pub(crate) struct SchedulerInner {
    /// One queue per worker. Never resized.
    queues: Box<[CachePadded<WorkerQueue>]>,
    /// Number of items enqueued and not yet dequeued, across all queues.
    /// Incremented before an item becomes visible, so it never underflows.
    pending: CachePadded<AtomicUsize>,
    /// Pool metadata. This mutex never protects the queues themselves.
    state: Mutex<PoolState>,
    /// Signaled when the pending count goes from 0 to 1, and when the last
    /// group unregisters.
    work_pending: Condvar,
    /// Signaled when the remaining count of a group reaches 0, and when the
    /// pending count goes from 0 to 1.
    group_finished: Condvar,
    /// Policy to pin worker threads to CPUs.
    cpu_pinning: CpuPinningPolicy,
    /// Number of queued items at which submitters drain the queues.
    pending_limit: usize,
    /// Bounded wait of idle threads.
    idle_timeout: Duration,
}

impl SchedulerInner {
    fn new(builder: &SchedulerBuilder) -> Self {
        let num_threads = builder.num_threads.count().get();
        builder.cpu_pinning.check_supported();
        Self {
            queues: (0..num_threads)
                .map(|index| CachePadded::new(WorkerQueue::new(index)))
                .collect(),
            pending: CachePadded::new(AtomicUsize::new(0)),
            state: Mutex::new(PoolState {
                registered_groups: 0,
                live_workers: vec![false; num_threads],
            }),
            work_pending: Condvar::new(),
            group_finished: Condvar::new(),
            cpu_pinning: builder.cpu_pinning,
            pending_limit: builder.pending_limit.max(1),
            idle_timeout: builder.idle_timeout,
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Attaches a task group, spawning the worker threads that aren't running.
    pub(crate) fn register(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        state.registered_groups += 1;
        for index in 0..self.queues.len() {
            if state.live_workers[index] {
                continue;
            }
            let scheduler = self.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("tasklight-worker-{index}"))
                .spawn(move || scheduler.worker_main(index));
            match spawned {
                Ok(_) => state.live_workers[index] = true,
                Err(_e) => log_error!("Failed to spawn worker thread #{index}: {_e}"),
            }
        }
    }

    /// Detaches a task group. Once no group is left, the worker threads exit.
    pub(crate) fn unregister(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.registered_groups > 0);
        state.registered_groups -= 1;
        if state.registered_groups == 0 {
            log_debug!("No task group left, notifying workers to exit");
            self.work_pending.notify_all();
        }
    }

    /// Number of worker threads currently running.
    #[cfg(test)]
    pub(crate) fn num_live_workers(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.live_workers.iter().filter(|&&live| live).count()
    }

    /// Main function run by a worker thread.
    fn worker_main(self: Arc<Self>, index: usize) {
        self.cpu_pinning.pin_current_thread(index);
        let registration = WorkerRegistration::enter(&self, index);
        let frame = DrainFrame::enter(&self, index);
        log_debug!("[worker {index}] Started");

        loop {
            self.run_tasks(index);

            let state = self.state.lock().unwrap();
            let mut state = self
                .work_pending
                .wait_timeout_while(state, self.idle_timeout, |state| {
                    state.registered_groups != 0 && self.pending() == 0
                })
                .unwrap()
                .0;
            if state.registered_groups == 0 && self.pending() == 0 {
                state.live_workers[index] = false;
                break;
            }
        }

        drop(frame);
        drop(registration);
        log_debug!("[worker {index}] Exiting");
    }

    /// Enqueues an item.
    ///
    /// From one of this scheduler's workers, the item goes to the worker's own
    /// queue. Otherwise, it goes to the first randomly picked queue whose lock
    /// is free. Past the pending limit, the calling thread executes queued
    /// items until the backlog is below the limit.
    pub(crate) fn submit(self: &Arc<Self>, item: WorkItem) {
        let was_empty = self.pending.fetch_add(1, Ordering::SeqCst) == 0;
        match self.local_index() {
            Some(index) => self.queues[index].push(item),
            None => {
                let backoff = Backoff::new();
                let mut item = item;
                loop {
                    let index = random_index(self.queues.len());
                    match self.queues[index].try_push(item) {
                        Ok(()) => break,
                        Err(rejected) => {
                            item = rejected;
                            backoff.snooze();
                        }
                    }
                }
            }
        }

        if was_empty {
            let _state = self.state.lock().unwrap();
            self.work_pending.notify_all();
            self.group_finished.notify_all();
        }

        if self.pending() >= self.pending_limit {
            log_trace!(
                "Pending limit of {} reached, draining from the submitting thread",
                self.pending_limit
            );
            let start = self.drain_start();
            let _frame = DrainFrame::enter(self, self.local_index().unwrap_or(0));
            while self.pending() >= self.pending_limit {
                if self.run_tasks(start) == 0 {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Scans the queues round-robin from the given index, executing the front
    /// item of each queue whose lock is free. Returns the number of items
    /// executed.
    pub(crate) fn run_tasks(self: &Arc<Self>, start: usize) -> usize {
        let num_queues = self.queues.len();
        let mut executed = 0;
        for probe in 0..num_queues * PROBES_PER_WORKER {
            if self.pending() == 0 {
                break;
            }
            if let Some(item) = self.queues[(start + probe) % num_queues].try_pop() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.execute(item);
                executed += 1;
            }
        }
        executed
    }

    fn execute(self: &Arc<Self>, item: WorkItem) {
        let group = {
            let _running = RunningItem::enter(self);
            item.run()
        };
        if group.finish_one() {
            let _state = self.state.lock().unwrap();
            self.group_finished.notify_all();
        }
    }

    /// Blocks until all items of the given group have completed, executing
    /// queued items in the meantime. Returns the aggregate success of the
    /// group.
    pub(crate) fn wait_group(self: &Arc<Self>, group: &GroupState) -> bool {
        let start = self.drain_start();
        let _frame = DrainFrame::enter(self, self.local_index().unwrap_or(0));
        while group.remaining() != 0 {
            if self.run_tasks(start) != 0 {
                continue;
            }
            let state = self.state.lock().unwrap();
            drop(
                self.group_finished
                    .wait_timeout_while(state, self.idle_timeout, |_| {
                        group.remaining() != 0 && self.pending() == 0
                    })
                    .unwrap(),
            );
        }
        group.success()
    }

    /// Queue index of the calling thread, if it is a worker of this scheduler.
    fn local_index(&self) -> Option<usize> {
        WORKER.with(|worker| match &*worker.borrow() {
            Some((scheduler, index)) if std::ptr::eq(&**scheduler, self) => Some(*index),
            _ => None,
        })
    }

    /// Queue index at which the calling thread starts a draining scan.
    fn drain_start(&self) -> usize {
        self.local_index()
            .unwrap_or_else(|| random_index(self.queues.len()))
    }
}

fn random_index(len: usize) -> usize {
    RNG.with(|rng| rng.borrow_mut().random_range(0..len))
}

/// Registers the calling thread as a worker until dropped.
struct WorkerRegistration;

impl WorkerRegistration {
    fn enter(scheduler: &Arc<SchedulerInner>, index: usize) -> Self {
        WORKER.with(|worker| *worker.borrow_mut() = Some((scheduler.clone(), index)));
        WorkerRegistration
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        // The scheduler reference is released outside of the borrow.
        let previous = WORKER.with(|worker| worker.borrow_mut().take());
        drop(previous);
    }
}

/// Makes the calling thread drain the given scheduler, as seen by
/// [`current_worker_index()`] and [`current_num_workers()`], until dropped.
struct DrainFrame;

impl DrainFrame {
    fn enter(scheduler: &Arc<SchedulerInner>, index: usize) -> Self {
        FRAMES.with(|frames| frames.borrow_mut().push((scheduler.clone(), index)));
        DrainFrame
    }
}

impl Drop for DrainFrame {
    fn drop(&mut self) {
        let previous = FRAMES.with(|frames| frames.borrow_mut().pop());
        drop(previous);
    }
}

/// Marks a work item of the given scheduler as running on the calling thread
/// until dropped.
struct RunningItem;

impl RunningItem {
    fn enter(scheduler: &Arc<SchedulerInner>) -> Self {
        RUNNING.with(|running| running.borrow_mut().push(scheduler.clone()));
        RunningItem
    }
}

impl Drop for RunningItem {
    fn drop(&mut self) {
        let previous = RUNNING.with(|running| running.borrow_mut().pop());
        drop(previous);
    }
}

/// Context of the work item running on a thread, carried over to a thread
/// that runs a fiber body on the item's behalf.
#[cfg_attr(
    all(feature = "ucontext", target_os = "linux", target_env = "gnu"),
    allow(dead_code)
)]
#[derive(Clone)]
pub(crate) struct ItemContext {
    /// Scheduler of the item.
    scheduler: Arc<SchedulerInner>,
    /// Queue drained by the thread running the item.
    frame: Option<Frame>,
}

#[cfg_attr(
    all(feature = "ucontext", target_os = "linux", target_env = "gnu"),
    allow(dead_code)
)]
impl ItemContext {
    /// Captures the context of the innermost work item running on the calling
    /// thread, if any.
    pub(crate) fn capture() -> Option<Self> {
        match RUNNING.with(|running| running.borrow().last().cloned()) {
            Some(scheduler) => Some(ItemContext {
                scheduler,
                frame: FRAMES.with(|frames| frames.borrow().last().cloned()),
            }),
            None => INHERITED.with(|inherited| inherited.borrow().clone()),
        }
    }

    /// Makes the calling thread act on behalf of the given work item, until
    /// the next call.
    pub(crate) fn install(context: Option<Self>) {
        let previous = INHERITED.with(|inherited| inherited.replace(context));
        drop(previous);
    }
}

/// Scheduler of the innermost work item running on the calling thread.
fn current_running() -> Option<Arc<SchedulerInner>> {
    RUNNING
        .with(|running| running.borrow().last().cloned())
        .or_else(|| {
            INHERITED.with(|inherited| {
                inherited
                    .borrow()
                    .as_ref()
                    .map(|context| context.scheduler.clone())
            })
        })
}

/// Innermost queue drained by the calling thread.
fn current_frame() -> Option<Frame> {
    FRAMES
        .with(|frames| frames.borrow().last().cloned())
        .or_else(|| {
            INHERITED.with(|inherited| {
                inherited
                    .borrow()
                    .as_ref()
                    .and_then(|context| context.frame.clone())
            })
        })
}

/// Returns true if the calling thread is executing a work item.
pub fn in_task() -> bool {
    current_running().is_some()
}

/// Returns the index of the queue that the calling thread drains: its own
/// queue on a worker thread, or the queue it drains from while it waits for a
/// group or applies backpressure.
///
/// The index is always lower than [`current_num_workers()`].
pub fn current_worker_index() -> Option<usize> {
    current_frame().map(|(_, index)| index)
}

/// Returns the number of workers of the scheduler that the calling thread
/// drains. Within a work item, this is the item's scheduler.
pub fn current_num_workers() -> Option<usize> {
    current_frame().map(|(scheduler, _)| scheduler.queues.len())
}
