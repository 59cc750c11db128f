// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const NUM_ITEMS: &[usize] = &[100, 1_000, 10_000];
const NUM_YIELDS: &[usize] = &[1, 10, 100];
const STACK_SIZE: usize = 64 * 1024;

/// Benchmarks submitting empty items to a task group and waiting for them.
mod task_group {
    use super::{NUM_ITEMS, NUM_THREADS};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use tasklight::{CpuPinningPolicy, SchedulerBuilder, TaskGroup, ThreadCount};

    #[divan::bench(consts = NUM_THREADS, args = NUM_ITEMS)]
    fn submit_sync<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let scheduler = SchedulerBuilder {
            num_threads: ThreadCount::try_from(NUM_THREADS).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
            ..Default::default()
        }
        .build();
        let _keep_alive = TaskGroup::on(&scheduler, false);
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            let group = TaskGroup::on(&scheduler, false);
            for i in 0..len {
                group.submit(move || black_box(i) != usize::MAX);
            }
            group.sync()
        })
    }

    #[divan::bench(args = NUM_ITEMS)]
    fn in_task_query(bencher: Bencher, len: usize) {
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            (0..len)
                .filter(|_| black_box(tasklight::in_task()))
                .count()
        })
    }
}

/// Benchmarks switching in and out of fibers.
mod fiber {
    use super::{NUM_YIELDS, STACK_SIZE};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use tasklight::Fiber;

    #[divan::bench]
    fn create_finalize(bencher: Bencher) {
        bencher.bench_local(|| {
            let mut fiber = Fiber::new(STACK_SIZE, || true);
            black_box(fiber.finalize())
        })
    }

    #[divan::bench(args = NUM_YIELDS)]
    fn resume_yield(bencher: Bencher, yields: usize) {
        bencher
            .counter(ItemsCount::new(yields))
            .with_inputs(|| {
                Fiber::new(STACK_SIZE, move || {
                    for _ in 0..yields {
                        Fiber::yield_now();
                    }
                    true
                })
            })
            .bench_local_values(|mut fiber| {
                while !fiber.resume() {}
                black_box(fiber.success())
            })
    }
}
