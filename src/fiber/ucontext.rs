// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fiber backend switching machine contexts with `swapcontext()`: the body
//! runs on a dedicated stack, on the thread that resumes it.

use super::{Body, FiberContext};
use crate::macros::{log_error, log_warn};
use libc::{getcontext, makecontext, swapcontext, ucontext_t};
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, addr_of, addr_of_mut, NonNull};

/// Smallest stack handed to a fiber body.
const MIN_STACK_SIZE: usize = 64 * 1024;

thread_local! {
    /// Frame of the innermost fiber running on this thread, or null.
    static CURRENT: Cell<*mut Frame> = const { Cell::new(ptr::null_mut()) };
}

/// State of a fiber, at a stable address for the lifetime of the context.
struct Frame {
    /// Saved context of the body.
    fiber: ucontext_t,
    /// Saved context of the thread that last resumed the body.
    driver: ucontext_t,
    /// Body, until it starts.
    body: Option<Body>,
    /// Result of the body, once it has completed.
    result: Option<bool>,
    /// Whether yields are disabled.
    finalizing: bool,
}

/// Memory mapping used as a fiber stack, with a guard page at its low end.
struct Stack {
    /// Start of the mapping, i.e. of the guard page.
    base: NonNull<c_void>,
    /// Length of the mapping, guard page included.
    len: usize,
    /// Size of the guard page.
    guard: usize,
}

impl Stack {
    fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let len = size
            .max(MIN_STACK_SIZE)
            .div_ceil(page)
            .checked_mul(page)
            .and_then(|size| size.checked_add(page))
            .filter(|&len| len <= isize::MAX as usize)
            .ok_or(io::ErrorKind::OutOfMemory)?;
        let length = NonZeroUsize::new(len).ok_or(io::ErrorKind::InvalidInput)?;
        // SAFETY: This creates a new private anonymous mapping, which doesn't
        // alias any existing memory.
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK,
            )
        }?;
        let stack = Stack {
            base,
            len,
            guard: page,
        };
        // SAFETY: The first page belongs to the mapping created above, and
        // nothing references it.
        unsafe { mprotect(base, page, ProtFlags::PROT_NONE) }?;
        Ok(stack)
    }

    /// Lowest usable address of the stack.
    fn bottom(&self) -> *mut c_void {
        // SAFETY: The guard page is within the mapping.
        unsafe { self.base.as_ptr().cast::<u8>().add(self.guard).cast() }
    }

    /// Usable size of the stack.
    fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: The mapping was created by `Stack::new()` with this length, and
        // the fiber running on it has completed.
        if let Err(_e) = unsafe { munmap(self.base, self.len) } {
            log_error!("Failed to unmap a fiber stack: {_e}");
        }
    }
}

fn page_size() -> usize {
    // SAFETY: `sysconf()` has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        log_warn!("Failed to query the page size, assuming 4 KiB");
        4096
    }
}

/// Fiber context switched with `swapcontext()`.
///
/// Because the body runs on the resuming thread, this type isn't [`Send`]:
/// thread-local state seen by the body must not change under its feet.
pub(super) struct UContext {
    /// Heap-allocated frame, owned by this context.
    frame: NonNull<Frame>,
    /// Stack of the body.
    stack: Stack,
}

impl FiberContext for UContext {
    fn new(stack_size: usize, body: Body) -> io::Result<Self> {
        let stack = Stack::new(stack_size)?;
        let frame = Box::into_raw(Box::new(Frame {
            // SAFETY: `ucontext_t` is a plain C struct, for which all zeros is a
            // valid (if meaningless) value. It is initialized by `getcontext()`.
            fiber: unsafe { std::mem::zeroed() },
            // SAFETY: Same as above, initialized by the first `swapcontext()`.
            driver: unsafe { std::mem::zeroed() },
            body: Some(body),
            result: None,
            finalizing: false,
        }));
        // SAFETY: `frame` comes from `Box::into_raw()`, so it is non-null.
        let frame = unsafe { NonNull::new_unchecked(frame) };

        let f = frame.as_ptr();
        // SAFETY: `f` points to the live frame allocated above. The stack is
        // moved into the returned context, which completes the body before
        // releasing the stack.
        unsafe {
            if getcontext(addr_of_mut!((*f).fiber)) != 0 {
                let error = io::Error::last_os_error();
                drop(Box::from_raw(f));
                return Err(error);
            }
            (*f).fiber.uc_stack.ss_sp = stack.bottom();
            (*f).fiber.uc_stack.ss_size = stack.size();
            (*f).fiber.uc_link = addr_of_mut!((*f).driver);
            makecontext(addr_of_mut!((*f).fiber), fiber_entry, 0);
        }
        Ok(UContext { frame, stack })
    }

    fn switch_in(&mut self) -> Option<bool> {
        let f = self.frame.as_ptr();
        // SAFETY: The frame is live for the lifetime of `self`, and only accessed
        // by the body while the driver is suspended in `swapcontext()`.
        unsafe {
            if let Some(result) = (*f).result {
                return Some(result);
            }
            let previous = CURRENT.with(|current| current.replace(f));
            let status = swapcontext(addr_of_mut!((*f).driver), addr_of!((*f).fiber));
            CURRENT.with(|current| current.set(previous));
            if status != 0 {
                panic!(
                    "Failed to switch to a fiber: {}",
                    io::Error::last_os_error()
                );
            }
            (*f).result
        }
    }

    fn set_finalizing(&mut self) {
        // SAFETY: The frame is live and the body is suspended.
        unsafe { (*self.frame.as_ptr()).finalizing = true };
    }

    fn yield_current() {
        let f = CURRENT.with(Cell::get);
        if f.is_null() {
            return;
        }
        // SAFETY: A non-null current frame belongs to the context that switched
        // into the running body, and stays live until the body completes.
        unsafe {
            if (*f).finalizing {
                return;
            }
            if swapcontext(addr_of_mut!((*f).fiber), addr_of!((*f).driver)) != 0 {
                panic!(
                    "Failed to yield from a fiber: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }

    fn in_fiber() -> bool {
        !CURRENT.with(Cell::get).is_null()
    }
}

impl Drop for UContext {
    fn drop(&mut self) {
        // SAFETY: The frame is live until released below.
        if unsafe { (*self.frame.as_ptr()).result.is_none() } {
            self.set_finalizing();
            while self.switch_in().is_none() {}
        }
        // SAFETY: The frame was allocated by `Box::into_raw()` in `new()`, and
        // the body that references it has completed.
        drop(unsafe { Box::from_raw(self.frame.as_ptr()) });
    }
}

/// Entry point of a fiber body, on the fiber stack. Returning from it switches
/// back to the driver through `uc_link`.
extern "C" fn fiber_entry() {
    let f = CURRENT.with(Cell::get);
    // SAFETY: `switch_in()` sets the current frame right before switching here.
    let body = unsafe { (*f).body.take() };
    let result = match body {
        Some(body) => catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
            log_error!("A fiber body panicked, completing the fiber as failed");
            false
        }),
        None => false,
    };
    // SAFETY: Same as above, the frame outlives the body.
    unsafe { (*f).result = Some(result) };
}
