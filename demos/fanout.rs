// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of task groups and fibers.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasklight::{CpuPinningPolicy, Fiber, SchedulerBuilder, TaskGroup, ThreadCount};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let scheduler = SchedulerBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: if cli.pin_threads {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
        pending_limit: cli.pending_limit,
        idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
    }
    .build();
    println!("{scheduler:?}");

    let start = Instant::now();
    match cli.scenario {
        Scenario::Sum => {
            let sum = Arc::new(AtomicU64::new(0));
            let group = TaskGroup::on(&scheduler, cli.stop_after_error);
            for i in 0..cli.num_items {
                let sum = sum.clone();
                group.submit(move || {
                    sum.fetch_add(black_box(i), Ordering::Relaxed);
                    true
                });
            }
            let success = group.sync();
            println!("success = {success}, sum = {}", sum.load(Ordering::Relaxed));
        }
        Scenario::Nested => {
            let leaves = Arc::new(AtomicU64::new(0));
            let group = TaskGroup::on(&scheduler, cli.stop_after_error);
            fan_out(&group, cli.depth, cli.width, leaves.clone());
            let success = group.sync();
            println!(
                "success = {success}, leaves = {}",
                leaves.load(Ordering::Relaxed)
            );
        }
        Scenario::Failures => {
            let mut rng = ChaCha12Rng::seed_from_u64(cli.seed);
            let executed = Arc::new(AtomicUsize::new(0));
            let group = TaskGroup::on(&scheduler, cli.stop_after_error);
            for _ in 0..cli.num_items {
                let fail = rng.random_range(0..cli.failure_rarity.get()) == 0;
                let executed = executed.clone();
                group.submit(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                    !fail
                });
            }
            let success = group.sync();
            println!(
                "success = {success}, executed = {} / {}",
                executed.load(Ordering::Relaxed),
                cli.num_items
            );
        }
        Scenario::Fibers => {
            let total = Arc::new(AtomicU64::new(0));
            let group = TaskGroup::on(&scheduler, cli.stop_after_error);
            for i in 0..cli.num_items {
                let total = total.clone();
                let steps = cli.depth as u64;
                let stack_size = cli.stack_size;
                group.submit(move || {
                    let mut fiber = Fiber::new(stack_size, move || {
                        for step in 0..steps {
                            total.fetch_add(i * steps + step, Ordering::Relaxed);
                            Fiber::yield_now();
                        }
                        true
                    });
                    while !fiber.resume() {}
                    fiber.success() == Some(true)
                });
            }
            let success = group.sync();
            println!(
                "success = {success}, total = {}",
                total.load(Ordering::Relaxed)
            );
        }
    }
    println!("elapsed = {:?}", start.elapsed());
}

/// Recursively submits `width` items per level, each creating its own nested
/// group, down to `depth` levels.
fn fan_out(group: &TaskGroup, depth: usize, width: u64, leaves: Arc<AtomicU64>) {
    for _ in 0..width {
        let leaves = leaves.clone();
        group.submit(move || {
            if depth <= 1 {
                leaves.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                let nested = TaskGroup::new(false);
                fan_out(&nested, depth - 1, width, leaves);
                nested.sync()
            }
        });
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_threads: bool,

    /// Number of pending items at which submitters start draining the queues.
    #[arg(long, default_value_t = tasklight::DEFAULT_PENDING_LIMIT)]
    pending_limit: usize,

    /// How long idle workers wait for work, in milliseconds.
    #[arg(long, default_value_t = 100)]
    idle_timeout_ms: u64,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items to submit. Unused by the nested scenario.
    #[arg(long, default_value_t = 1_000)]
    num_items: u64,

    /// Number of items submitted by each group of the nested scenario, which
    /// runs `width ^ depth` leaves.
    #[arg(long, default_value_t = 10)]
    width: u64,

    /// Nesting depth of the nested scenario, or number of yields per fiber.
    #[arg(long, default_value_t = 3)]
    depth: usize,

    /// Whether to skip the remaining items of a group after a failure.
    #[arg(long, default_value_t = false)]
    stop_after_error: bool,

    /// One in this many items fails in the failures scenario.
    #[arg(long, default_value_t = NonZeroUsize::new(100).unwrap())]
    failure_rarity: NonZeroUsize,

    /// Seed of the random generator.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Stack size of each fiber, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    stack_size: usize,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sums integers, one item per integer.
    Sum,
    /// Recursively fans out nested groups.
    Nested,
    /// Runs items of which a random subset fails.
    Failures,
    /// Runs one fiber per item, resumed until completion.
    Fibers,
}
