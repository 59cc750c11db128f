// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::macros::{log_debug, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::convert::TryFrom;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Hard cap on the number of worker threads of a single scheduler.
pub const MAX_THREADS: usize = 256;

/// Number of threads to spawn in a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn, clamped to [`MAX_THREADS`].
    ///
    /// If the available parallelism cannot be determined, this falls back to a
    /// single thread.
    pub fn count(self) -> NonZeroUsize {
        let count = match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed, using 1 thread: {_e}");
                    NonZeroUsize::MIN
                })
            }
            ThreadCount::Count(count) => count,
        };
        if count.get() > MAX_THREADS {
            log_warn!("Requested {count} threads, clamping to {MAX_THREADS}");
            NonZeroUsize::new(MAX_THREADS).unwrap_or(NonZeroUsize::MIN)
        } else {
            count
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), spawning a worker will panic.
    Always,
}

impl CpuPinningPolicy {
    /// Checks upfront whether this policy can be honored on this platform.
    pub(crate) fn check_supported(self) {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match self {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }
    }

    /// Pins the calling thread to the CPU with the given index, according to
    /// this policy.
    pub(crate) fn pin_current_thread(self, id: usize) {
        #[cfg(all(
            not(miri),
            any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            )
        ))]
        match self {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                let mut cpu_set = CpuSet::new();
                if let Err(_e) = cpu_set.set(id) {
                    log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
                } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
                } else {
                    log_debug!("Pinned thread #{id} to CPU #{id}");
                }
            }
            CpuPinningPolicy::Always => {
                let mut cpu_set = CpuSet::new();
                if let Err(e) = cpu_set.set(id) {
                    panic!("Failed to set CPU affinity for thread #{id}: {e}");
                } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    panic!("Failed to set CPU affinity for thread #{id}: {e}");
                } else {
                    log_debug!("Pinned thread #{id} to CPU #{id}");
                }
            }
        }
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        let _ = id;
    }
}

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status without waiting on the condition variable.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Waits until the predicate is true on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_thread_count_clamped() {
        let count = ThreadCount::try_from(MAX_THREADS + 10).unwrap().count();
        assert_eq!(count.get(), MAX_THREADS);

        let count = ThreadCount::try_from(3).unwrap().count();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_thread_count_available_parallelism() {
        let count = ThreadCount::AvailableParallelism.count();
        assert!(count.get() <= MAX_THREADS);
    }

    #[test]
    fn test_status_wait_while() {
        let status = Arc::new(Status::new(0));
        let thread = std::thread::spawn({
            let status = status.clone();
            move || status.notify_all(42)
        });
        let guard = status.wait_while(|x| *x == 0);
        assert_eq!(*guard, 42);
        drop(guard);
        thread.join().unwrap();
    }
}
