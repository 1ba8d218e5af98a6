//! A test-and-set (TAS) lock.
//!
//! The whole lock state is one atomic boolean. Acquiring tasks repeatedly
//! swap `true` into it until they observe that the previous value was
//! `false`; releasing stores `false` back. There is no queue and therefore no
//! fairness: under sustained contention an unlucky task can starve. What the
//! lock gives back is simplicity, a single word of state and the lowest
//! uncontended cost of the family.

use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Release};

use crate::cfg::atomic::AtomicBool;
use crate::cfg::cell::{UnsafeCell, WithUnchecked};
use crate::relax::Wait;

#[cfg(all(test, not(loom)))]
use crate::test::{LockData, LockNew, LockThen};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will block tasks waiting for the lock to become available. The
/// mutex can be created via a [`new`] constructor. Each mutex has a type
/// parameter which represents the data that it is protecting. The data can
/// only be accessed through the RAII guards returned from [`lock`], which
/// guarantees that the data is only ever accessed when the mutex is locked.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use std::sync::mpsc::channel;
///
/// use tasklock::raw::tas;
/// use tasklock::relax::{RelaxWait, Spin};
///
/// type Mutex<T> = tas::Mutex<T, RelaxWait<Spin>>;
///
/// const N: usize = 10;
///
/// // Spawn a few threads to increment a shared variable (non-atomically),
/// // and let the main thread know once all increments are done.
/// let data = Arc::new(Mutex::new(0));
///
/// let (tx, rx) = channel();
/// for _ in 0..N {
///     let (data, tx) = (data.clone(), tx.clone());
///     thread::spawn(move || {
///         // The shared state can only be accessed once the lock is held.
///         let mut data = data.lock();
///         *data += 1;
///         if *data == N {
///             tx.send(()).unwrap();
///         }
///         // the lock is unlocked here when `data` goes out of scope.
///     });
/// }
///
/// rx.recv().unwrap();
/// ```
/// [`new`]: Mutex::new
/// [`lock`]: Mutex::lock
pub struct Mutex<T: ?Sized, W> {
    locked: AtomicBool,
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
    /// use tasklock::raw::tas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        let locked = AtomicBool::new(false);
        let data = UnsafeCell::new(value);
        Self { locked, data, wait: PhantomData }
    }
}

impl<T: ?Sized, W: Wait> Mutex<T, W> {
    /// Acquires this mutex, blocking the current task until it is able to do
    /// so.
    ///
    /// An RAII guard is returned to allow scoped unlock of the lock. When the
    /// guard goes out of scope, the mutex will be unlocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use tasklock::raw::tas::spins::Mutex;
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
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, W> {
        W::wait_while(|| self.locked.swap(true, Acquire));
        MutexGuard::new(self)
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// Once the closure returns, the guard is dropped and the mutex unlocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::tas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// mutex.lock_with(|mut guard| *guard = 10);
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    ///
    /// Compile fail: borrows of the guard or its data cannot escape the given
    /// closure:
    ///
    /// ```compile_fail,E0515
    /// use tasklock::raw::tas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(1);
    /// let data = mutex.lock_with(|guard| &*guard);
    /// ```
    #[inline]
    pub fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, W>) -> Ret,
    {
        f(self.lock())
    }
}

impl<T: ?Sized, W> Mutex<T, W> {
    /// Returns `true` if the lock is currently held.
    ///
    /// The answer is advisory: by the time the caller looks at it, another
    /// task may already have locked or unlocked the mutex. It must not be
    /// used for synchronization.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::tas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(());
    /// assert!(!mutex.is_locked());
    ///
    /// let guard = mutex.lock();
    /// assert!(mutex.is_locked());
    ///
    /// drop(guard);
    /// assert!(!mutex.is_locked());
    /// ```
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Acquire)
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs
    /// to take place - the mutable borrow statically guarantees no locks
    /// exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::tas::spins::Mutex;
    ///
    /// let mut mutex = Mutex::new(0);
    /// *mutex.get_mut() = 10;
    ///
    /// assert_eq!(*mutex.lock(), 10);
    /// ```
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
/// The data protected by the mutex can be accessed through this guard via
/// its [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is returned by the [`lock`] method on [`Mutex`]. It is also
/// given as closure argument by the [`lock_with`] method.
///
/// [`Deref`]: core::ops::Deref
/// [`DerefMut`]: core::ops::DerefMut
/// [`lock`]: Mutex::lock
/// [`lock_with`]: Mutex::lock_with
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, W: Wait> {
    lock: &'a Mutex<T, W>,
    // Guards must be released by the task that acquired the lock.
    marker: PhantomData<*mut ()>,
}

// A guard that could cross tasks would allow a release by a task that never
// acquired, which the lock contracts forbid. Same unsafe Sync impl as
// `std::sync::MutexGuard`.
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
        self.lock.locked.store(false, Release);
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

/// A TAS lock that waits by spinning with a CPU pause hint.
pub mod spins {
    use crate::relax::{RelaxWait, Spin};

    /// A [`tas::Mutex`] that spins with a CPU pause hint during contention.
    ///
    /// # Example
    ///
    /// ```
    /// use tasklock::raw::tas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.lock();
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`tas::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, RelaxWait<Spin>>;

    /// A [`tas::MutexGuard`] of the [`Mutex`] above.
    ///
    /// [`tas::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, RelaxWait<Spin>>;

    /// A TAS lock that backs off exponentially, escalating to cooperative
    /// yields under persistent contention.
    pub mod backoff {
        use crate::relax::{Backoff, RelaxWait};

        /// A [`tas::Mutex`] that backs off exponentially during contention,
        /// suspending the task to the scheduler once contention persists.
        ///
        /// # Example
        ///
        /// ```
        /// use tasklock::raw::tas::spins::backoff::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// let guard = mutex.lock();
        /// assert_eq!(*guard, 0);
        /// ```
        /// [`tas::Mutex`]: super::super::Mutex
        pub type Mutex<T> = super::super::Mutex<T, RelaxWait<Backoff>>;

        /// A [`tas::MutexGuard`] of the [`Mutex`] above.
        ///
        /// [`tas::MutexGuard`]: super::super::MutexGuard
        pub type MutexGuard<'a, T> = super::super::MutexGuard<'a, T, RelaxWait<Backoff>>;
    }
}

/// A TAS lock that waits through the task runtime's yield-while primitive.
pub mod yields {
    use crate::relax::YieldWait;

    /// A [`tas::Mutex`] that suspends the waiting task between probes.
    ///
    /// # Example
    ///
    /// ```
    /// use tasklock::raw::tas::yields::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.lock();
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`tas::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, YieldWait>;

    /// A [`tas::MutexGuard`] of the [`Mutex`] above.
    ///
    /// [`tas::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, YieldWait>;
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::raw::tas::yields::Mutex;
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
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<Mutex<_>, Mutex<_>>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<Mutex<_>>();
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
    fn is_locked_tracks_guard_lifetime() {
        let mutex = Mutex::new(());
        assert!(!mutex.is_locked());

        let guard = mutex.lock();
        assert!(mutex.is_locked());

        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn backoff_contenders_yield_at_least_once() {
        use crate::raw::tas::spins::backoff;
        use crate::runtime;

        let mutex = Arc::new(backoff::Mutex::new(()));
        let guard = mutex.lock();

        let contenders: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    let before = runtime::yield_count();
                    drop(mutex.lock());
                    assert!(runtime::yield_count() > before);
                })
            })
            .collect();

        // Hold the lock long enough for every contender to escalate past the
        // suspension threshold.
        thread::sleep(Duration::from_millis(10));
        drop(guard);

        for contender in contenders {
            contender.join().unwrap();
        }
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::raw::tas::yields::Mutex;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }
}
