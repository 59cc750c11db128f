// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Portable fiber backend: the body runs on a dedicated thread, which only
//! makes progress while the driving thread waits for it.

use super::{Body, FiberContext};
use crate::core::util::Status;
use crate::core::ItemContext;
use crate::macros::{log_debug, log_error};
use std::cell::RefCell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Which side of the fiber is allowed to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Turn {
    /// The driving thread runs, the body is suspended (or not started).
    Driver,
    /// The body runs, the driving thread waits.
    Body,
    /// The body has completed with the given result.
    Done(bool),
}

/// State shared between the driving thread and the fiber thread.
struct Shared {
    /// Which side runs.
    turn: Status<Turn>,
    /// Whether yields are disabled.
    finalizing: AtomicBool,
    /// Work item that the driving thread runs, handed to the body for its
    /// next turn.
    context: Mutex<Option<ItemContext>>,
}

thread_local! {
    /// Fiber whose body runs on this thread, if any.
    static CURRENT: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// Fiber context backed by a dedicated OS thread.
pub(super) struct ThreadContext {
    /// State shared with the fiber thread.
    shared: Arc<Shared>,
    /// Handle to the fiber thread.
    handle: Option<JoinHandle<()>>,
}

impl FiberContext for ThreadContext {
    fn new(stack_size: usize, body: Body) -> io::Result<Self> {
        if stack_size > isize::MAX as usize {
            return Err(io::ErrorKind::OutOfMemory.into());
        }
        let shared = Arc::new(Shared {
            turn: Status::new(Turn::Driver),
            finalizing: AtomicBool::new(false),
            context: Mutex::new(None),
        });
        let handle = std::thread::Builder::new()
            .name("tasklight-fiber".into())
            .stack_size(stack_size)
            .spawn({
                let shared = shared.clone();
                move || run_body(shared, body)
            })?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn switch_in(&mut self) -> Option<bool> {
        if let Turn::Done(result) = *self.shared.turn.lock() {
            return Some(result);
        }
        *self.shared.context.lock().unwrap() = ItemContext::capture();
        self.shared.turn.notify_all(Turn::Body);
        let turn = *self.shared.turn.wait_while(|turn| *turn == Turn::Body);
        match turn {
            Turn::Driver => None,
            Turn::Done(result) => Some(result),
            Turn::Body => unreachable!(),
        }
    }

    fn set_finalizing(&mut self) {
        self.shared.finalizing.store(true, Ordering::SeqCst);
    }

    fn yield_current() {
        let Some(shared) = CURRENT.with(|current| current.borrow().clone()) else {
            return;
        };
        if shared.finalizing.load(Ordering::SeqCst) {
            return;
        }
        shared.turn.notify_all(Turn::Driver);
        drop(shared.turn.wait_while(|turn| *turn == Turn::Driver));
        shared.begin_turn();
    }

    fn in_fiber() -> bool {
        CURRENT.with(|current| current.borrow().is_some())
    }
}

impl Drop for ThreadContext {
    /// Completes the body if needed, and joins the fiber thread.
    fn drop(&mut self) {
        if !matches!(*self.shared.turn.lock(), Turn::Done(_)) {
            self.set_finalizing();
            while self.switch_in().is_none() {}
        }
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => log_debug!("Joined fiber thread"),
                Err(_e) => log_error!("Fiber thread joined with error: {_e:?}"),
            }
        }
    }
}

impl Shared {
    /// Makes the fiber thread act on behalf of the driver's work item, if any.
    fn begin_turn(&self) {
        ItemContext::install(self.context.lock().unwrap().take());
    }
}

/// Main function of a fiber thread.
fn run_body(shared: Arc<Shared>, body: Body) {
    drop(shared.turn.wait_while(|turn| *turn != Turn::Body));
    shared.begin_turn();
    CURRENT.with(|current| *current.borrow_mut() = Some(shared.clone()));

    let result = catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        log_error!("A fiber body panicked, completing the fiber as failed");
        false
    });

    let previous = CURRENT.with(|current| current.borrow_mut().take());
    drop(previous);
    ItemContext::install(None);
    shared.turn.notify_all(Turn::Done(result));
}
