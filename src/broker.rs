//! Per-task storage for queue-lock waiter nodes.
//!
//! The queue locks hand a heap-allocated waiter node from `lock` to the
//! matching `unlock` on the same task. A thread-local slot would be wrong for
//! that: a cooperative runtime may suspend the task inside `lock` and resume
//! it on a different worker thread, where the thread-local points at some
//! other task's node. The association therefore goes through the pointer
//! sized payload word the task runtime keeps attached to the task itself
//! (see [`crate::runtime`]), keyed by task identity rather than by worker.
//!
//! One word per task means one association per task: a task may have at most
//! one broker-mediated acquisition in flight. Acquiring a second queue lock
//! while holding one is outside the locks' contract.

use core::ptr::NonNull;

use crate::runtime;

/// Associates `node` with the currently running task, overwriting any
/// previous association.
pub(crate) fn attach<N>(node: NonNull<N>) {
    runtime::runtime().set_task_data(node.as_ptr() as usize);
}

/// Returns the node most recently attached by the currently running task.
///
/// # Safety
///
/// The current task must have previously passed a valid, still-live node of
/// type `N` to [`attach`], with no other queue-lock acquisition in between.
pub(crate) unsafe fn current<N>() -> NonNull<N> {
    let data = runtime::runtime().task_data();
    debug_assert!(data != 0, "no waiter node attached to the current task");
    // SAFETY: Caller guaranteed that the payload word holds the pointer this
    // task attached, and attached pointers are non-null.
    unsafe { NonNull::new_unchecked(data as *mut N) }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::ptr::NonNull;

    #[test]
    fn attach_then_current() {
        let mut first = 1u64;
        let mut second = 2u64;

        super::attach(NonNull::from(&mut first));
        assert_eq!(unsafe { super::current::<u64>() }, NonNull::from(&mut first));

        // A later acquisition on the same task overwrites the slot.
        super::attach(NonNull::from(&mut second));
        assert_eq!(unsafe { super::current::<u64>() }, NonNull::from(&mut second));
    }

    #[test]
    fn associations_are_per_task() {
        let mut local = 7u32;
        super::attach(NonNull::from(&mut local));

        std::thread::spawn(|| {
            let mut other = 9u32;
            super::attach(NonNull::from(&mut other));
            assert_eq!(unsafe { super::current::<u32>() }, NonNull::from(&mut other));
        })
        .join()
        .unwrap();

        assert_eq!(unsafe { super::current::<u32>() }, NonNull::from(&mut local));
    }
}
