//! Drives the lock primitives under controlled contention profiles.
//!
//! Every case shares a single lock and a single counter among `--num-tasks`
//! task bodies, distributed over a pool of worker threads. Three profiles
//! bracket how much of each task's work happens inside the critical section:
//!
//! - `small`: lock, increment, unlock, then the whole grain outside. Models
//!   fine-grained atomic updates.
//! - `med`: half the grain before taking the lock, then increment and the
//!   other half inside. Models partially-guarded work.
//! - `big`: increment and the whole grain inside. Models queue/linked-list
//!   style workloads that live under the lock.
//!
//! Each case runs three times; the reported figure is the mean wall-clock
//! time in seconds.

use std::num::NonZeroUsize;
use std::sync::Mutex as SysMutex;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::info;

use tasklock::raw::{clh, mcs, tas, ttas};

#[derive(Parser, Debug)]
#[command(about = "Benchmarks lock primitives under contention")]
struct Args {
    /// Number of tasks to launch per case.
    #[arg(long, default_value_t = 10_000)]
    num_tasks: u64,

    /// Grain size of each task, in microseconds of artificial work.
    #[arg(long, default_value_t = 100)]
    grain_size: u64,
}

fn worker_count() -> usize {
    thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(4)
}

/// Runs `num_tasks` task bodies distributed over the worker pool.
fn run_tasks<F: Fn() + Sync>(num_tasks: u64, task: F) {
    let workers = worker_count() as u64;
    thread::scope(|scope| {
        let task = &task;
        for worker in 0..workers {
            let share = num_tasks / workers + u64::from(worker < num_tasks % workers);
            scope.spawn(move || {
                for _ in 0..share {
                    task();
                }
            });
        }
    });
}

/// Busy-waits until `micros` microseconds have elapsed.
///
/// Deliberately never yields: the point is to occupy the task (and, inside a
/// critical section, the lock) for a measured interval.
fn artificial_work(micros: u64) {
    let start = Instant::now();
    while start.elapsed().as_micros() < u128::from(micros) {}
}

/// Uniform locking surface over every benched mutex type.
trait BenchLock: Sync {
    fn new() -> Self;

    fn critical<Ret, F: FnOnce(&mut u64) -> Ret>(&self, f: F) -> Ret;
}

impl BenchLock for SysMutex<u64> {
    fn new() -> Self {
        SysMutex::new(0)
    }

    fn critical<Ret, F: FnOnce(&mut u64) -> Ret>(&self, f: F) -> Ret {
        f(&mut *self.lock().unwrap())
    }
}

macro_rules! impl_bench_lock {
    ($($mutex:ty),+ $(,)?) => {$(
        impl BenchLock for $mutex {
            fn new() -> Self {
                Self::new(0)
            }

            fn critical<Ret, F: FnOnce(&mut u64) -> Ret>(&self, f: F) -> Ret {
                self.lock_with(|mut guard| f(&mut *guard))
            }
        }
    )+};
}

impl_bench_lock!(
    tas::spins::Mutex<u64>,
    tas::spins::backoff::Mutex<u64>,
    ttas::spins::Mutex<u64>,
    ttas::spins::backoff::Mutex<u64>,
    mcs::spins::Mutex<u64>,
    mcs::yields::Mutex<u64>,
    clh::spins::Mutex<u64>,
    clh::spins::backoff::Mutex<u64>,
);

/// Minimum work under the lock; the grain is spent outside the critical
/// section.
fn critical_small<L: BenchLock>(num_tasks: u64, grain_size: u64) -> u64 {
    let lock = L::new();
    run_tasks(num_tasks, || {
        lock.critical(|counter| *counter += 1);
        artificial_work(grain_size);
    });
    lock.critical(|counter| *counter)
}

/// Half the grain before taking the lock, the other half (plus the
/// increment) inside the critical section.
fn critical_med<L: BenchLock>(num_tasks: u64, grain_size: u64) -> u64 {
    let lock = L::new();
    run_tasks(num_tasks, || {
        artificial_work(grain_size / 2);
        lock.critical(|counter| {
            *counter += 1;
            artificial_work(grain_size / 2);
        });
    });
    lock.critical(|counter| *counter)
}

/// The whole grain inside the critical section.
fn critical_big<L: BenchLock>(num_tasks: u64, grain_size: u64) -> u64 {
    let lock = L::new();
    run_tasks(num_tasks, || {
        lock.critical(|counter| {
            *counter += 1;
            artificial_work(grain_size);
        });
    });
    lock.critical(|counter| *counter)
}

/// Runs per case, averaged into the reported time.
const RUNS: u32 = 3;

struct Invoker {
    num_tasks: u64,
    grain_size: u64,
}

impl Invoker {
    fn new(num_tasks: u64, grain_size: u64) -> Self {
        println!("{:<30}{}", "Name", "Time (in s)");
        Self { num_tasks, grain_size }
    }

    fn invoke<F: Fn(u64, u64) -> u64>(&self, name: &str, case: F) {
        let start = Instant::now();
        for _ in 0..RUNS {
            case(self.num_tasks, self.grain_size);
        }
        let elapsed = start.elapsed().as_secs_f64() / f64::from(RUNS);
        println!("{name:<30}{elapsed:.6}");
    }
}

macro_rules! bench {
    ($invoker:expr, $($name:literal => $mutex:ty),+ $(,)?) => {$(
        $invoker.invoke(concat!($name, "_critical_small"), critical_small::<$mutex>);
        $invoker.invoke(concat!($name, "_critical_med"), critical_med::<$mutex>);
        $invoker.invoke(concat!($name, "_critical_big"), critical_big::<$mutex>);
    )+};
}

fn main() -> Result<()> {
    env_logger::try_init()?;
    let args = Args::parse();
    info!(
        "{} workers, {} tasks per case, {}us grain",
        worker_count(),
        args.num_tasks,
        args.grain_size
    );

    let invoker = Invoker::new(args.num_tasks, args.grain_size);
    invoker.invoke("no_locks", |num_tasks, grain_size| {
        run_tasks(num_tasks, || artificial_work(grain_size));
        0
    });

    bench!(
        invoker,
        "sys_mutex" => SysMutex<u64>,
        "tas" => tas::spins::Mutex<u64>,
        "tas_bo" => tas::spins::backoff::Mutex<u64>,
        "ttas" => ttas::spins::Mutex<u64>,
        "ttas_bo" => ttas::spins::backoff::Mutex<u64>,
        "mcs" => mcs::spins::Mutex<u64>,
        "mcs_bo" => mcs::yields::Mutex<u64>,
        "clh" => clh::spins::Mutex<u64>,
        "clh_bo" => clh::spins::backoff::Mutex<u64>,
    );

    Ok(())
}

#[cfg(test)]
mod test {
    use super::{critical_big, critical_med, critical_small};
    use tasklock::raw::{clh, mcs, tas};

    #[test]
    fn small_profile_counts_every_task() {
        assert_eq!(critical_small::<tas::spins::Mutex<u64>>(100, 0), 100);
    }

    #[test]
    fn med_profile_counts_every_task() {
        assert_eq!(critical_med::<mcs::yields::Mutex<u64>>(100, 0), 100);
    }

    #[test]
    fn big_profile_counts_every_task() {
        assert_eq!(critical_big::<clh::spins::backoff::Mutex<u64>>(100, 0), 100);
    }
}
