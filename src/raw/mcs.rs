//! An MCS (Mellor-Crummey and Scott) lock.
//!
//! A fair, FIFO queue lock. Acquiring tasks atomically exchange themselves
//! into the lock's tail pointer, forming an explicit waiting queue, and then
//! spin on a flag inside their *own* heap allocated queue node. The releasing
//! task hands the lock over by clearing its successor's flag, so every waiter
//! busy-waits on a distinct cache line and the lock word itself stays quiet
//! while the lock is held.
//!
//! Queue nodes are owned by the acquiring task for the whole critical
//! section and freed by it during release. Since a cooperative runtime may
//! resume a task on a different worker thread between acquire and release,
//! the node pointer travels through the per-task broker rather than through
//! thread-local storage (see [`crate::broker`]). One consequence is that a
//! task may have at most one in-flight acquisition across all queue locks:
//! acquiring a second queue lock while already holding one is not supported.

use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_utils::CachePadded;

use crate::broker;
use crate::cfg::atomic::{AtomicBool, AtomicPtr};
use crate::cfg::cell::{UnsafeCell, WithUnchecked};
use crate::relax::Wait;

#[cfg(all(test, not(loom)))]
use crate::test::{LockData, LockNew, LockThen};

/// A waiter in the lock's queue, owned by exactly one in-flight acquisition.
struct Node {
    /// While the task is queued behind a predecessor: "my predecessor has
    /// not yet released to me". Written once by the predecessor, with
    /// release semantics.
    waiting: AtomicBool,
    /// Publication edge towards the predecessor, written once by the
    /// successor after it installed itself as tail.
    next: AtomicPtr<CachePadded<Node>>,
}

impl Node {
    fn new() -> Self {
        let waiting = AtomicBool::new(false);
        let next = AtomicPtr::new(ptr::null_mut());
        Self { waiting, next }
    }
}

#[cfg(all(test, not(loom)))]
pub(crate) mod counters {
    use core::cell::Cell;

    std::thread_local! {
        pub static NODE_ALLOCS: Cell<u64> = const { Cell::new(0) };
        pub static NODE_FREES: Cell<u64> = const { Cell::new(0) };
    }
}

/// Allocates a fresh queue node, padded to its own cache line.
fn alloc_node() -> NonNull<CachePadded<Node>> {
    #[cfg(all(test, not(loom)))]
    counters::NODE_ALLOCS.with(|count| count.set(count.get() + 1));
    let node = Box::new(CachePadded::new(Node::new()));
    // SAFETY: `Box::into_raw` never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
}

/// Frees a queue node previously returned by [`alloc_node`].
///
/// # Safety
///
/// The caller must own the node: no other task may reach it anymore.
unsafe fn free_node(node: NonNull<CachePadded<Node>>) {
    #[cfg(all(test, not(loom)))]
    counters::NODE_FREES.with(|count| count.set(count.get() + 1));
    // SAFETY: The memory was allocated through the Box API and, per the
    // caller's contract, this is the last pointer to it.
    drop(unsafe { Box::from_raw(node.as_ptr()) });
}

/// A mutual exclusion primitive implementing the MCS lock protocol, useful
/// for protecting shared data.
///
/// Unlike [TAS](crate::raw::tas) and [TTAS](crate::raw::ttas), acquisitions
/// are granted in the order they were requested: the atomic exchange on the
/// lock's tail linearizes acquirers, and each one is released by its direct
/// predecessor. No task can overtake another.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use tasklock::raw::mcs::spins::Mutex;
///
/// let mutex = Arc::new(Mutex::new(0));
/// let c_mutex = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     *c_mutex.lock() = 10;
/// })
/// .join().expect("thread::spawn failed");
///
/// assert_eq!(*mutex.lock(), 10);
/// ```
pub struct Mutex<T: ?Sized, W> {
    /// Most recently queued waiter, or null when the lock is free with no
    /// waiters.
    tail: AtomicPtr<CachePadded<Node>>,
    wait: PhantomData<W>,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send, W> Send for Mutex<T, W> {}
unsafe impl<T: ?Sized + Send, W> Sync for Mutex<T, W> {}

impl<T, W> Mutex<T, W> {
    /// Creates a new mutex in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::mcs::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        let tail = AtomicPtr::new(ptr::null_mut());
        let data = UnsafeCell::new(value);
        Self { tail, data, wait: PhantomData }
    }
}

impl<T: ?Sized, W: Wait> Mutex<T, W> {
    /// Acquires this mutex, blocking the current task until it is able to do
    /// so.
    ///
    /// Tasks enter the critical section in the order their `lock` calls
    /// reached the lock's internal queue.
    ///
    /// The queue node backing this acquisition is associated with the
    /// current task until the guard is dropped; acquiring another queue lock
    /// while the guard is live is not supported (see the [module docs]).
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::mcs::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() = 10;
    /// assert_eq!(*mutex.lock(), 10);
    /// ```
    /// [module docs]: crate::raw::mcs
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, W> {
        let node = alloc_node();
        broker::attach(node);
        let pred = self.tail.swap(node.as_ptr(), AcqRel);
        if !pred.is_null() {
            // SAFETY: The node is not reachable by the predecessor until the
            // `next` store below publishes it.
            let node_ref = unsafe { node.as_ref() };
            node_ref.waiting.store(true, Relaxed);
            // SAFETY: The predecessor cannot free its node before observing
            // this store: its release path either wins the tail compare
            // exchange (impossible, we already replaced the tail) or waits
            // for `next` to become non-null.
            unsafe { &*pred }.next.store(node.as_ptr(), Release);
            W::wait_while(|| node_ref.waiting.load(Acquire));
        }
        MutexGuard::new(self)
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// Once the closure returns, the guard is dropped and the mutex unlocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::mcs::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// mutex.lock_with(|mut guard| *guard = 10);
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    #[inline]
    pub fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, W>) -> Ret,
    {
        f(self.lock())
    }

    /// Releases the lock held by the current task.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the task whose `lock` call produced
    /// the live guard.
    unsafe fn unlock(&self) {
        // SAFETY: The matching `lock` attached this task's node and no other
        // queue-lock acquisition ran in between (guard contract).
        let node = unsafe { broker::current::<CachePadded<Node>>() };
        let node_ref = unsafe { node.as_ref() };

        let mut next = node_ref.next.load(Acquire);
        if next.is_null() {
            // No successor published itself yet. If the tail still points
            // here there is none at all, and the lock becomes free.
            if self
                .tail
                .compare_exchange(node.as_ptr(), ptr::null_mut(), Release, Relaxed)
                .is_ok()
            {
                // SAFETY: The queue is empty, nobody else can reach the node.
                unsafe { free_node(node) };
                return;
            }
            // A successor replaced the tail but has not linked itself yet.
            W::wait_while(|| {
                next = node_ref.next.load(Acquire);
                next.is_null()
            });
        }
        // The handover: the successor's acquire-phase spin pairs with this
        // store.
        unsafe { &*next }.waiting.store(false, Release);
        // SAFETY: The successor spins on its own node, never on this one.
        unsafe { free_node(node) };
    }
}

impl<T: ?Sized, W> Mutex<T, W> {
    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs
    /// to take place - the mutable borrow statically guarantees no locks
    /// exist.
    #[cfg(not(all(loom, test)))]
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: We hold exclusive access to the Mutex data.
        unsafe { &mut *self.data.get() }
    }
}

impl<T: Default, W> Default for Mutex<T, W> {
    /// Creates a `Mutex<T, W>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T, W> From<T> for Mutex<T, W> {
    /// Creates a `Mutex<T, W>` from a instance of `T`.
    #[inline]
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug, W: Wait> Debug for Mutex<T, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        self.lock_with(|guard| guard.with(|data| d.field("data", &data)));
        d.finish()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be unlocked.
///
/// This structure is returned by the [`lock`] method on [`Mutex`]. It is also
/// given as closure argument by the [`lock_with`] method.
///
/// [`lock`]: Mutex::lock
/// [`lock_with`]: Mutex::lock_with
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, W: Wait> {
    lock: &'a Mutex<T, W>,
    // Release must run on the acquiring task: it retrieves the queue node
    // through that task's broker slot.
    marker: PhantomData<*mut ()>,
}

// Same unsafe Sync impl as `std::sync::MutexGuard`.
unsafe impl<T: ?Sized + Sync, W: Wait> Sync for MutexGuard<'_, T, W> {}

impl<'a, T: ?Sized, W: Wait> MutexGuard<'a, T, W> {
    /// Creates a new `MutexGuard` instance.
    const fn new(lock: &'a Mutex<T, W>) -> Self {
        Self { lock, marker: PhantomData }
    }

    /// Runs `f` against a shared reference pointing to the underlying data.
    fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { self.lock.data.with_unchecked(f) }
    }
}

impl<T: ?Sized, W: Wait> Drop for MutexGuard<'_, T, W> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: Drop runs at most once, on the task that acquired.
        unsafe { self.lock.unlock() }
    }
}

impl<T: ?Sized + Debug, W: Wait> Debug for MutexGuard<'_, T, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

impl<T: ?Sized + Display, W: Wait> Display for MutexGuard<'_, T, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, W: Wait> core::ops::Deref for MutexGuard<'_, T, W> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data.get() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, W: Wait> core::ops::DerefMut for MutexGuard<'_, T, W> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

/// SAFETY: A guard instance holds the lock locked, with exclusive access to
/// the underlying data.
#[cfg(all(loom, test))]
unsafe impl<T: ?Sized, W: Wait> crate::loom::Guard for MutexGuard<'_, T, W> {
    type Target = T;

    fn get(&self) -> &loom::cell::UnsafeCell<Self::Target> {
        &self.lock.data
    }
}

#[cfg(all(loom, test))]
impl<T: ?Sized, W: Wait> crate::loom::LockWith for Mutex<T, W> {
    type Target = T;

    type Guard<'a> = MutexGuard<'a, T, W>
    where
        Self: 'a,
        T: 'a;

    fn new(value: T) -> Self
    where
        T: Sized,
    {
        Self::new(value)
    }

    fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, W>) -> Ret,
    {
        self.lock_with(f)
    }
}

#[cfg(all(test, not(loom)))]
impl<T: ?Sized, W> LockNew for Mutex<T, W> {
    type Target = T;

    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized,
    {
        Self::new(value)
    }
}

#[cfg(all(test, not(loom)))]
impl<T: ?Sized, W: Wait> LockThen for Mutex<T, W> {
    type Guard<'a> = MutexGuard<'a, T, W>
    where
        Self: 'a,
        T: 'a;

    fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, W>) -> Ret,
    {
        self.lock_with(f)
    }
}

#[cfg(all(test, not(loom)))]
impl<T: ?Sized, W: Wait> LockData for Mutex<T, W> {
    fn get_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

/// An MCS lock that waits by spinning with a CPU pause hint.
pub mod spins {
    use crate::relax::{RelaxWait, Spin};

    /// An [`mcs::Mutex`] that spins with a CPU pause hint during contention.
    ///
    /// # Example
    ///
    /// ```
    /// use tasklock::raw::mcs::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.lock();
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`mcs::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, RelaxWait<Spin>>;

    /// An [`mcs::MutexGuard`] of the [`Mutex`] above.
    ///
    /// [`mcs::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, RelaxWait<Spin>>;

    /// An MCS lock that backs off exponentially, escalating to cooperative
    /// yields under persistent contention.
    pub mod backoff {
        use crate::relax::{Backoff, RelaxWait};

        /// An [`mcs::Mutex`] that backs off exponentially while waiting on
        /// its queue node.
        ///
        /// # Example
        ///
        /// ```
        /// use tasklock::raw::mcs::spins::backoff::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// let guard = mutex.lock();
        /// assert_eq!(*guard, 0);
        /// ```
        /// [`mcs::Mutex`]: super::super::Mutex
        pub type Mutex<T> = super::super::Mutex<T, RelaxWait<Backoff>>;

        /// An [`mcs::MutexGuard`] of the [`Mutex`] above.
        ///
        /// [`mcs::MutexGuard`]: super::super::MutexGuard
        pub type MutexGuard<'a, T> = super::super::MutexGuard<'a, T, RelaxWait<Backoff>>;
    }
}

/// An MCS lock that waits through the task runtime's yield-while primitive.
///
/// This is the cooperative flavor of the lock: while a task waits on its
/// queue node, the scheduler is free to run other ready tasks on the same
/// worker.
pub mod yields {
    use crate::relax::YieldWait;

    /// An [`mcs::Mutex`] that suspends the waiting task between probes.
    ///
    /// # Example
    ///
    /// ```
    /// use tasklock::raw::mcs::yields::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.lock();
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`mcs::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, YieldWait>;

    /// An [`mcs::MutexGuard`] of the [`Mutex`] above.
    ///
    /// [`mcs::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, YieldWait>;
}

#[cfg(all(not(loom), test))]
mod test {
    use super::counters::{NODE_ALLOCS, NODE_FREES};
    use crate::raw::mcs::yields::Mutex;
    use crate::test::tests;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<Mutex<_>>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<Mutex<_>>();
    }

    #[test]
    fn test_guard_debug_display() {
        tests::test_guard_debug_display::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_from() {
        tests::test_mutex_from::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_default() {
        tests::test_mutex_default::<Mutex<_>>();
    }

    #[test]
    fn test_get_mut() {
        tests::test_get_mut::<Mutex<_>>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<Mutex<_>>();
    }

    #[test]
    fn test_lock_unsized() {
        tests::test_lock_unsized::<Mutex<_>>();
    }

    #[test]
    fn fifo_admission() {
        tests::fifo_admission::<Mutex<_>>();
    }

    #[test]
    fn backoff_flavor_excludes_under_contention() {
        use crate::raw::mcs::spins::backoff;
        tests::lots_and_lots_lock::<backoff::Mutex<_>>();
    }

    #[test]
    fn node_turnover_is_balanced() {
        let allocs = NODE_ALLOCS.with(|count| count.get());
        let frees = NODE_FREES.with(|count| count.get());

        let mutex = Mutex::new(0);
        for _ in 0..1000 {
            *mutex.lock() += 1;
        }
        assert_eq!(*mutex.lock(), 1000);

        // Every uncontended handoff on this task allocated one node in
        // `lock` and freed it in the matching `unlock`.
        assert_eq!(NODE_ALLOCS.with(|count| count.get()), allocs + 1001);
        assert_eq!(NODE_FREES.with(|count| count.get()), frees + 1001);
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::raw::mcs::yields::Mutex;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }
}
