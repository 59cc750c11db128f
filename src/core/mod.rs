// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: scheduler, worker queues and task groups.

mod queue;
mod scheduler;
mod task_group;
pub(crate) mod util;

pub(crate) use scheduler::ItemContext;
pub use scheduler::{
    current_num_workers, current_worker_index, in_task, Scheduler, SchedulerBuilder,
    DEFAULT_PENDING_LIMIT,
};
pub use task_group::TaskGroup;
pub use util::{CpuPinningPolicy, ThreadCount, MAX_THREADS};
