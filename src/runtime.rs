//! A narrow facade over the cooperative task runtime the locks run on.
//!
//! The lock algorithms do not know, nor care, how lightweight tasks are
//! multiplexed onto worker threads. Everything they need from the scheduler
//! fits in the [`Runtime`] trait: a stable identity for the running task, a
//! single pointer-sized payload attached to that task, and a way to
//! cooperatively give the current worker away. Queue locks route their waiter
//! node pointers through the payload word, which is why the payload must
//! follow the *task* when the scheduler migrates it to another worker, and
//! why plain thread-local storage cannot back this trait on an M:N runtime.
//!
//! A process-wide runtime is installed at most once with [`set_runtime`],
//! before the first lock operation. When no runtime has been installed, the
//! facade falls back to [`ThreadRuntime`], a collaborator that maps each task
//! onto one OS thread. That is the right default for tests, benchmarks and
//! plain threaded programs; systems embedding a task scheduler implement
//! [`Runtime`] on their side and install it during startup.
//!
//! # Example
//!
//! ```
//! use tasklock::runtime;
//!
//! let me = runtime::current_task();
//! assert_eq!(me, runtime::current_task());
//!
//! // Give other ready tasks a chance to run on this worker.
//! runtime::yield_now();
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::OnceLock;

use crate::cfg::hint;

/// An opaque identifier of a lightweight task.
///
/// Identifiers are comparable and hashable, and remain stable for the whole
/// lifetime of their task, across suspensions and worker migrations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// The operations the locks require from a cooperative task runtime.
///
/// All methods address the task that is *currently running* on the calling
/// worker thread. Implementations must keep the payload word attached to the
/// task itself, so that a task suspended on one worker and resumed on another
/// still observes the value it stored.
pub trait Runtime: Sync {
    /// Returns the identity of the currently running task.
    fn current(&self) -> TaskId;

    /// Returns the payload word attached to the currently running task, or
    /// zero if none was ever attached.
    fn task_data(&self) -> usize;

    /// Attaches a payload word to the currently running task, overwriting
    /// any previous value.
    fn set_task_data(&self, data: usize);

    /// Suspends the currently running task and requeues it, allowing other
    /// ready tasks to run on this worker.
    fn yield_now(&self);
}

static RUNTIME: OnceLock<&'static dyn Runtime> = OnceLock::new();

/// The error returned when a runtime could not be installed.
///
/// A runtime can only be installed once per process, and only before the
/// facade has been exercised for the first time.
#[derive(Debug)]
pub struct SetRuntimeError(());

impl fmt::Display for SetRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a task runtime has already been installed")
    }
}

impl std::error::Error for SetRuntimeError {}

/// Installs the process-wide task runtime.
///
/// Must be called before any lock operation; once the facade has handed out
/// the default [`ThreadRuntime`], or a runtime has already been installed,
/// this fails with [`SetRuntimeError`].
pub fn set_runtime(runtime: &'static dyn Runtime) -> Result<(), SetRuntimeError> {
    RUNTIME.set(runtime).map_err(|_| SetRuntimeError(()))
}

/// Returns the installed runtime, falling back to [`ThreadRuntime`].
pub(crate) fn runtime() -> &'static dyn Runtime {
    *RUNTIME.get_or_init(|| &ThreadRuntime)
}

/// Returns the identity of the currently running task.
#[must_use]
pub fn current_task() -> TaskId {
    runtime().current()
}

/// Cooperatively suspends the current task, requeueing it for later
/// execution.
pub fn yield_now() {
    runtime().yield_now();
}

/// Spin probes issued by [`yield_while`] before it starts yielding.
const SPIN_PROBES: u32 = 8;

/// Waits until `cond` returns false, briefly spinning and then yielding the
/// current task to the scheduler between probes.
///
/// This is the cooperative counterpart of a bare spin loop: workers are not
/// monopolized while the condition holds, so tasks that would make the
/// condition false are still able to run, even on a single worker.
pub fn yield_while<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..SPIN_PROBES {
        if !cond() {
            return;
        }
        hint::spin_loop();
    }
    while cond() {
        yield_now();
    }
}

/// The bundled collaborator: a runtime where each task is one OS thread.
///
/// Task identity is a per-thread id handed out on first use, the payload
/// word lives with that thread, and yielding maps onto
/// [`std::thread::yield_now`]. Since a "task" here never migrates off its
/// thread, per-thread storage is per-task storage.
pub struct ThreadRuntime;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

struct TaskSlot {
    id: TaskId,
    data: core::cell::Cell<usize>,
    #[cfg(all(test, not(loom)))]
    yields: core::cell::Cell<u64>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Relaxed)),
            data: core::cell::Cell::new(0),
            #[cfg(all(test, not(loom)))]
            yields: core::cell::Cell::new(0),
        }
    }
}

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static TASK: TaskSlot = TaskSlot::new();
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static TASK: TaskSlot = TaskSlot::new();
}

impl Runtime for ThreadRuntime {
    fn current(&self) -> TaskId {
        TASK.with(|task| task.id)
    }

    fn task_data(&self) -> usize {
        TASK.with(|task| task.data.get())
    }

    fn set_task_data(&self, data: usize) {
        TASK.with(|task| task.data.set(data));
    }

    fn yield_now(&self) {
        #[cfg(all(test, not(loom)))]
        TASK.with(|task| task.yields.set(task.yields.get() + 1));
        crate::cfg::thread::yield_now();
    }
}

/// How many times the current task has yielded through [`ThreadRuntime`].
#[cfg(all(test, not(loom)))]
pub(crate) fn yield_count() -> u64 {
    TASK.with(|task| task.yields.get())
}

#[cfg(all(not(loom), test))]
mod test {
    use std::thread;

    use super::{current_task, set_runtime, yield_while, Runtime, TaskId};

    #[test]
    fn task_ids_are_stable_and_distinct() {
        let me = current_task();
        assert_eq!(me, current_task());

        let other = thread::spawn(current_task).join().unwrap();
        assert_ne!(me, other);
    }

    #[test]
    fn task_data_roundtrips() {
        let runtime = super::runtime();
        runtime.set_task_data(0xdead);
        assert_eq!(runtime.task_data(), 0xdead);
        runtime.set_task_data(0);
        assert_eq!(runtime.task_data(), 0);
    }

    #[test]
    fn yield_while_observes_false() {
        let mut probes = 0;
        yield_while(|| {
            probes += 1;
            probes < 100
        });
        assert_eq!(probes, 100);
    }

    /// Delegates to the default runtime, so winning the installation race
    /// does not change the behavior of concurrently running tests.
    struct Forwarding;

    impl Runtime for Forwarding {
        fn current(&self) -> TaskId {
            super::ThreadRuntime.current()
        }

        fn task_data(&self) -> usize {
            super::ThreadRuntime.task_data()
        }

        fn set_task_data(&self, data: usize) {
            super::ThreadRuntime.set_task_data(data);
        }

        fn yield_now(&self) {
            super::ThreadRuntime.yield_now();
        }
    }

    #[test]
    fn install_is_one_shot() {
        static FORWARDING: Forwarding = Forwarding;
        // The first installation may lose the race against the default.
        let _ = set_runtime(&FORWARDING);
        assert!(set_runtime(&FORWARDING).is_err());
    }
}
