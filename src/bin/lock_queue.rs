//! Benchmarks a lock-guarded queue, the "everything under the lock"
//! workload.
//!
//! Each case pushes `--num-push-pop` integers through a [`VecDeque`] guarded
//! by one of the lock types, across the worker pool, then pops the same
//! count. Each case runs three times; the reported figure is the mean
//! wall-clock time in seconds.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex as SysMutex;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::info;

use tasklock::raw::{clh, mcs, tas, ttas};

#[derive(Parser, Debug)]
#[command(about = "Benchmarks a lock-guarded queue")]
struct Args {
    /// Number of push (and pop) operations per case.
    #[arg(long, default_value_t = 10_000)]
    num_push_pop: u64,
}

fn worker_count() -> usize {
    thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(4)
}

/// Runs `op` for every index in `0..count`, distributed over the worker
/// pool.
fn run_ops<F: Fn(u64) + Sync>(count: u64, op: F) {
    let workers = worker_count() as u64;
    thread::scope(|scope| {
        let op = &op;
        for worker in 0..workers {
            scope.spawn(move || {
                let mut index = worker;
                while index < count {
                    op(index);
                    index += workers;
                }
            });
        }
    });
}

/// Uniform locking surface over every benched mutex type.
trait QueueLock: Sync {
    fn new() -> Self;

    fn with<Ret, F: FnOnce(&mut VecDeque<i32>) -> Ret>(&self, f: F) -> Ret;
}

impl QueueLock for SysMutex<VecDeque<i32>> {
    fn new() -> Self {
        SysMutex::new(VecDeque::new())
    }

    fn with<Ret, F: FnOnce(&mut VecDeque<i32>) -> Ret>(&self, f: F) -> Ret {
        f(&mut *self.lock().unwrap())
    }
}

macro_rules! impl_queue_lock {
    ($($mutex:ty),+ $(,)?) => {$(
        impl QueueLock for $mutex {
            fn new() -> Self {
                Self::new(VecDeque::new())
            }

            fn with<Ret, F: FnOnce(&mut VecDeque<i32>) -> Ret>(&self, f: F) -> Ret {
                self.lock_with(|mut guard| f(&mut *guard))
            }
        }
    )+};
}

impl_queue_lock!(
    tas::spins::Mutex<VecDeque<i32>>,
    ttas::spins::Mutex<VecDeque<i32>>,
    mcs::spins::Mutex<VecDeque<i32>>,
    clh::spins::Mutex<VecDeque<i32>>,
);

/// A queue whose every operation runs under the lock `L`.
struct Queue<L> {
    inner: L,
}

impl<L: QueueLock> Queue<L> {
    fn new() -> Self {
        Self { inner: L::new() }
    }

    fn push(&self, item: i32) {
        self.inner.with(|queue| queue.push_back(item));
    }

    fn pop(&self) -> Option<i32> {
        self.inner.with(|queue| queue.pop_front())
    }

    fn len(&self) -> usize {
        self.inner.with(|queue| queue.len())
    }
}

/// Pushes `num_push_pop` items, then pops the same count; returns the final
/// queue length.
fn push_pop<L: QueueLock>(num_push_pop: u64) -> usize {
    let queue = Queue::<L>::new();
    run_ops(num_push_pop, |index| queue.push(index as i32));
    run_ops(num_push_pop, |_| {
        let _ = queue.pop();
    });
    queue.len()
}

/// Runs per case, averaged into the reported time.
const RUNS: u32 = 3;

struct Invoker {
    num_push_pop: u64,
}

impl Invoker {
    fn new(num_push_pop: u64) -> Self {
        println!("{:<30}{}", "Name", "Time (in s)");
        Self { num_push_pop }
    }

    fn invoke<F: Fn(u64) -> usize>(&self, name: &str, case: F) {
        let start = Instant::now();
        for _ in 0..RUNS {
            case(self.num_push_pop);
        }
        let elapsed = start.elapsed().as_secs_f64() / f64::from(RUNS);
        println!("{name:<30}{elapsed:.6}");
    }
}

fn main() -> Result<()> {
    env_logger::try_init()?;
    let args = Args::parse();
    info!("{} workers, {} push-pop pairs per case", worker_count(), args.num_push_pop);

    let invoker = Invoker::new(args.num_push_pop);
    invoker.invoke("sys_mutex", push_pop::<SysMutex<VecDeque<i32>>>);
    invoker.invoke("tas_lock", push_pop::<tas::spins::Mutex<VecDeque<i32>>>);
    invoker.invoke("ttas_lock", push_pop::<ttas::spins::Mutex<VecDeque<i32>>>);
    invoker.invoke("mcs_lock", push_pop::<mcs::spins::Mutex<VecDeque<i32>>>);
    invoker.invoke("clh_lock", push_pop::<clh::spins::Mutex<VecDeque<i32>>>);

    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::push_pop;
    use tasklock::raw::{clh, mcs};

    #[test]
    fn push_then_pop_drains_the_queue() {
        assert_eq!(push_pop::<mcs::spins::Mutex<VecDeque<i32>>>(10_000), 0);
    }

    #[test]
    fn clh_queue_drains_too() {
        assert_eq!(push_pop::<clh::spins::Mutex<VecDeque<i32>>>(10_000), 0);
    }
}
