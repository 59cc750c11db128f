// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cooperative fibers: closures that run on their own stack and can suspend
//! themselves mid-execution.
//!
//! The way control is transferred between the driving thread and a fiber
//! body is selected at build time:
//! - by default, each fiber body runs on a dedicated OS thread, and control
//!   is handed back and forth via a mutex-condvar pair,
//! - with the `ucontext` feature on Linux/glibc, fiber bodies run on a
//!   dedicated stack of the driving thread, switched via `swapcontext()`.

#[cfg_attr(
    all(feature = "ucontext", target_os = "linux", target_env = "gnu"),
    allow(dead_code)
)]
mod thread;
#[cfg(all(feature = "ucontext", target_os = "linux", target_env = "gnu"))]
#[allow(unsafe_code)]
mod ucontext;

use crate::macros::log_error;
use std::io;

/// Backend selected for [`Fiber`].
#[cfg(not(all(feature = "ucontext", target_os = "linux", target_env = "gnu")))]
type Backend = thread::ThreadContext;
#[cfg(all(feature = "ucontext", target_os = "linux", target_env = "gnu"))]
type Backend = ucontext::UContext;

/// Type-erased body of a fiber.
type Body = Box<dyn FnOnce() -> bool + Send + 'static>;

/// Execution context of a fiber, transferring control between the driving
/// thread and the fiber body.
trait FiberContext: Sized {
    /// Allocates a context that will run the given body with (at least) the
    /// given stack size. The body doesn't start before the first
    /// [`switch_in()`](Self::switch_in).
    fn new(stack_size: usize, body: Body) -> io::Result<Self>;

    /// Runs the body until it yields or completes. Returns the result of the
    /// body once it has completed.
    fn switch_in(&mut self) -> Option<bool>;

    /// Turns every further yield of the body into a no-op.
    fn set_finalizing(&mut self);

    /// Suspends the innermost fiber body running on the calling thread. Does
    /// nothing outside of a fiber body.
    fn yield_current();

    /// Returns true if the calling thread is running a fiber body.
    fn in_fiber() -> bool;
}

/// A closure running on its own stack, that can suspend itself with
/// [`Fiber::yield_now()`] and be resumed by the driving thread with
/// [`resume()`](Fiber::resume).
///
/// A fiber goes from created to running (suspended) to done, and never back.
/// Dropping a fiber that isn't done runs its body to completion, with yields
/// turned into no-ops.
///
/// A body resumed from within a work item runs on behalf of that item, even
/// with the thread backend: [`in_task()`](crate::in_task) is true, and
/// [`TaskGroup::new()`](crate::TaskGroup::new) reuses the item's scheduler.
///
/// ```
/// # use tasklight::Fiber;
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # use std::sync::Arc;
/// let steps = Arc::new(AtomicUsize::new(0));
/// let mut fiber = Fiber::new(64 * 1024, {
///     let steps = steps.clone();
///     move || {
///         for _ in 0..3 {
///             steps.fetch_add(1, Ordering::SeqCst);
///             Fiber::yield_now();
///         }
///         true
///     }
/// });
/// assert!(fiber.is_valid());
///
/// assert!(!fiber.resume());
/// assert_eq!(steps.load(Ordering::SeqCst), 1);
/// assert!(!fiber.resume());
/// assert_eq!(steps.load(Ordering::SeqCst), 2);
///
/// // Runs the rest of the body without suspending.
/// assert!(fiber.finalize());
/// assert!(fiber.is_done());
/// assert_eq!(steps.load(Ordering::SeqCst), 3);
/// ```
pub struct Fiber {
    /// Execution context, or [`None`] if it couldn't be allocated.
    context: Option<Backend>,
    /// Result of the body, once it has completed.
    result: Option<bool>,
}

impl Fiber {
    /// Creates a fiber running the given body, with (at least) the given stack
    /// size.
    ///
    /// If the execution context cannot be allocated, the error is logged and
    /// the returned fiber is inert: see [`is_valid()`](Self::is_valid).
    pub fn new(stack_size: usize, body: impl FnOnce() -> bool + Send + 'static) -> Self {
        Self::try_new(stack_size, body).unwrap_or_else(|_e| {
            log_error!("Failed to allocate a fiber with a stack of {stack_size} bytes: {_e}");
            Self {
                context: None,
                result: None,
            }
        })
    }

    /// Creates a fiber running the given body, with (at least) the given stack
    /// size, or returns the error that prevented allocating its execution
    /// context.
    pub fn try_new(
        stack_size: usize,
        body: impl FnOnce() -> bool + Send + 'static,
    ) -> io::Result<Self> {
        Ok(Self {
            context: Some(Backend::new(stack_size, Box::new(body))?),
            result: None,
        })
    }

    /// Returns false if this fiber is inert because its execution context
    /// couldn't be allocated. An inert fiber never runs its body:
    /// [`resume()`](Self::resume) and [`finalize()`](Self::finalize) return
    /// false.
    pub fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    /// Returns true once the body has completed.
    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }

    /// Returns the result of the body, once it has completed.
    pub fn success(&self) -> Option<bool> {
        self.result
    }

    /// Runs the body until it yields or completes: the first call starts the
    /// body, subsequent calls continue where it last yielded.
    ///
    /// Returns true if the fiber is done. This does nothing on a fiber that is
    /// already done.
    pub fn resume(&mut self) -> bool {
        if self.result.is_none() {
            if let Some(context) = &mut self.context {
                self.result = context.switch_in();
            }
        }
        self.result.is_some()
    }

    /// Runs the body to completion, ignoring any further yield. Returns the
    /// result of the body.
    ///
    /// On a fiber that is already done, this only returns the stored result.
    pub fn finalize(&mut self) -> bool {
        if let Some(context) = &mut self.context {
            if self.result.is_none() {
                context.set_finalizing();
            }
            while self.result.is_none() {
                self.result = context.switch_in();
            }
        }
        self.result.unwrap_or(false)
    }

    /// Suspends the calling fiber body, returning control to the thread that
    /// last resumed it.
    ///
    /// Outside of a fiber body, this does nothing. Inside a fiber that is
    /// being finalized, this does nothing either.
    pub fn yield_now() {
        Backend::yield_current()
    }

    /// Returns true if the calling code runs inside a fiber body.
    pub fn in_fiber() -> bool {
        Backend::in_fiber()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if !self.is_done() {
            self.finalize();
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("valid", &self.is_valid())
            .field("result", &self.result)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const STACK_SIZE: usize = 256 * 1024;

    #[test]
    fn test_completes_on_first_resume() {
        let mut fiber = Fiber::new(STACK_SIZE, || true);
        assert!(fiber.is_valid());
        assert!(!fiber.is_done());
        assert_eq!(fiber.success(), None);

        assert!(fiber.resume());
        assert!(fiber.is_done());
        assert_eq!(fiber.success(), Some(true));

        // No-ops on a completed fiber.
        assert!(fiber.finalize());
        assert!(fiber.resume());
        assert_eq!(fiber.success(), Some(true));
    }

    #[test]
    fn test_failure_result() {
        let mut fiber = Fiber::new(STACK_SIZE, || false);
        assert!(fiber.resume());
        assert_eq!(fiber.success(), Some(false));
        assert!(!fiber.finalize());
    }

    #[test]
    fn test_yield_once_needs_two_resumes() {
        let mut fiber = Fiber::new(STACK_SIZE, || {
            Fiber::yield_now();
            true
        });
        assert!(!fiber.resume());
        assert!(!fiber.is_done());
        assert!(fiber.resume());
        assert_eq!(fiber.success(), Some(true));
    }

    #[test]
    fn test_yield_once_resume_then_finalize() {
        let mut fiber = Fiber::new(STACK_SIZE, || {
            Fiber::yield_now();
            true
        });
        assert!(!fiber.resume());
        assert!(!fiber.is_done());
        assert!(fiber.finalize());
        assert!(fiber.is_done());
    }

    #[test]
    fn test_resume_continues_where_yielded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fiber = Fiber::new(STACK_SIZE, {
            let log = log.clone();
            move || {
                for i in 0..5 {
                    log.lock().unwrap().push(i);
                    Fiber::yield_now();
                }
                true
            }
        });
        for i in 0..5 {
            assert!(!fiber.resume());
            assert_eq!(*log.lock().unwrap(), (0..=i).collect::<Vec<_>>());
        }
        assert!(fiber.resume());
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_finalize_ignores_yields() {
        let steps = Arc::new(AtomicUsize::new(0));
        let mut fiber = Fiber::new(STACK_SIZE, {
            let steps = steps.clone();
            move || {
                for _ in 0..100 {
                    steps.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_now();
                }
                true
            }
        });
        assert!(fiber.finalize());
        assert_eq!(steps.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_drop_runs_to_completion() {
        let steps = Arc::new(AtomicUsize::new(0));
        {
            let mut fiber = Fiber::new(STACK_SIZE, {
                let steps = steps.clone();
                move || {
                    steps.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_now();
                    steps.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_now();
                    steps.fetch_add(1, Ordering::SeqCst);
                    true
                }
            });
            assert!(!fiber.resume());
            assert_eq!(steps.load(Ordering::SeqCst), 1);
        }
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_never_resumed() {
        let steps = Arc::new(AtomicUsize::new(0));
        drop(Fiber::new(STACK_SIZE, {
            let steps = steps.clone();
            move || {
                Fiber::yield_now();
                steps.fetch_add(1, Ordering::SeqCst);
                true
            }
        }));
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_outside_fiber_is_noop() {
        assert!(!Fiber::in_fiber());
        Fiber::yield_now();
        assert!(!Fiber::in_fiber());
    }

    #[test]
    fn test_in_fiber() {
        let mut fiber = Fiber::new(STACK_SIZE, || {
            let inside = Fiber::in_fiber();
            Fiber::yield_now();
            inside && Fiber::in_fiber()
        });
        assert!(!fiber.resume());
        assert!(!Fiber::in_fiber());
        assert!(fiber.resume());
        assert_eq!(fiber.success(), Some(true));
    }

    #[test]
    fn test_panicking_body_fails() {
        let mut fiber = Fiber::new(STACK_SIZE, || {
            Fiber::yield_now();
            panic!("fiber body panic")
        });
        assert!(!fiber.resume());
        assert!(fiber.resume());
        assert_eq!(fiber.success(), Some(false));
    }

    #[test]
    fn test_nested_fibers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut outer = Fiber::new(STACK_SIZE, {
            let log = log.clone();
            move || {
                let mut inner = Fiber::new(STACK_SIZE, {
                    let log = log.clone();
                    move || {
                        log.lock().unwrap().push("inner 1");
                        Fiber::yield_now();
                        log.lock().unwrap().push("inner 2");
                        true
                    }
                });
                assert!(!inner.resume());
                log.lock().unwrap().push("outer 1");
                Fiber::yield_now();
                assert!(inner.resume());
                log.lock().unwrap().push("outer 2");
                inner.finalize()
            }
        });
        assert!(!outer.resume());
        assert_eq!(*log.lock().unwrap(), vec!["inner 1", "outer 1"]);
        assert!(outer.resume());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["inner 1", "outer 1", "inner 2", "outer 2"]
        );
        assert_eq!(outer.success(), Some(true));
    }

    #[test]
    fn test_inert_fiber() {
        let mut fiber = Fiber {
            context: None,
            result: None,
        };
        assert!(!fiber.is_valid());
        assert!(!fiber.resume());
        assert!(!fiber.finalize());
        assert!(!fiber.is_done());
        assert_eq!(fiber.success(), None);
    }

    #[test]
    fn test_allocation_failure_is_inert() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut fiber = Fiber::new(usize::MAX, {
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        assert!(!fiber.is_valid());
        assert!(!fiber.resume());
        assert!(!fiber.finalize());
        assert!(!fiber.is_done());
        assert_eq!(fiber.success(), None);
        drop(fiber);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        assert!(Fiber::try_new(usize::MAX, || true).is_err());
        assert!(Fiber::try_new(isize::MAX as usize + 1, || true).is_err());
    }

    #[test]
    fn test_debug() {
        let mut fiber = Fiber::new(STACK_SIZE, || true);
        assert_eq!(format!("{fiber:?}"), "Fiber { valid: true, result: None }");
        fiber.resume();
        assert_eq!(
            format!("{fiber:?}"),
            "Fiber { valid: true, result: Some(true) }"
        );
    }
}
