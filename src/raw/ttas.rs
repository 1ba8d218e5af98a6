//! A test-and-test-and-set (TTAS) lock.
//!
//! State and contracts are identical to the [TAS lock](crate::raw::tas); the
//! difference is in how contention is probed. Waiting tasks first watch the
//! lock word with plain loads, which can be served from a shared cache line,
//! and only issue the swap once a load has observed the lock free. The
//! expensive read-modify-write (and the cache-line invalidation it causes on
//! every other waiter) thus only happens when the acquisition has a chance of
//! succeeding. Like TAS, the lock is unfair.

use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::cfg::cell::{UnsafeCell, WithUnchecked};
use crate::relax::Wait;

#[cfg(all(test, not(loom)))]
use crate::test::{LockData, LockNew, LockThen};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will block tasks waiting for the lock to become available,
/// probing the lock word with plain loads and only attempting the swap when
/// it was last seen free. The data protected by the mutex can only be
/// accessed through the RAII guards returned from [`lock`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use tasklock::raw::ttas::spins::Mutex;
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
    /// use tasklock::raw::ttas::spins::Mutex;
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
    /// use tasklock::raw::ttas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() = 10;
    /// assert_eq!(*mutex.lock(), 10);
    /// ```
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, W> {
        loop {
            // Contention probe; the swap below is what synchronizes.
            W::wait_while(|| self.locked.load(Relaxed));
            if !self.locked.swap(true, Acquire) {
                return MutexGuard::new(self);
            }
        }
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// Once the closure returns, the guard is dropped and the mutex unlocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use tasklock::raw::ttas::spins::Mutex;
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
    /// use tasklock::raw::ttas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(());
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
    // Guards must be released by the task that acquired the lock.
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

/// A TTAS lock that waits by spinning with a CPU pause hint.
pub mod spins {
    use crate::relax::{RelaxWait, Spin};

    /// A [`ttas::Mutex`] that spins with a CPU pause hint during contention.
    ///
    /// # Example
    ///
    /// ```
    /// use tasklock::raw::ttas::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.lock();
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`ttas::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, RelaxWait<Spin>>;

    /// A [`ttas::MutexGuard`] of the [`Mutex`] above.
    ///
    /// [`ttas::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, RelaxWait<Spin>>;

    /// A TTAS lock that backs off exponentially, escalating to cooperative
    /// yields under persistent contention.
    pub mod backoff {
        use crate::relax::{Backoff, RelaxWait};

        /// A [`ttas::Mutex`] that backs off exponentially during the read
        /// phase, suspending the task to the scheduler once contention
        /// persists.
        ///
        /// # Example
        ///
        /// ```
        /// use tasklock::raw::ttas::spins::backoff::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// let guard = mutex.lock();
        /// assert_eq!(*guard, 0);
        /// ```
        /// [`ttas::Mutex`]: super::super::Mutex
        pub type Mutex<T> = super::super::Mutex<T, RelaxWait<Backoff>>;

        /// A [`ttas::MutexGuard`] of the [`Mutex`] above.
        ///
        /// [`ttas::MutexGuard`]: super::super::MutexGuard
        pub type MutexGuard<'a, T> = super::super::MutexGuard<'a, T, RelaxWait<Backoff>>;
    }
}

/// A TTAS lock that waits through the task runtime's yield-while primitive.
pub mod yields {
    use crate::relax::YieldWait;

    /// A [`ttas::Mutex`] that suspends the waiting task between probes.
    ///
    /// # Example
    ///
    /// ```
    /// use tasklock::raw::ttas::yields::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.lock();
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`ttas::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, YieldWait>;

    /// A [`ttas::MutexGuard`] of the [`Mutex`] above.
    ///
    /// [`ttas::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, YieldWait>;
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::raw::ttas::yields::Mutex;
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
    fn backoff_flavor_excludes_under_contention() {
        use crate::raw::ttas::spins::backoff;
        tests::lots_and_lots_lock::<backoff::Mutex<_>>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::raw::ttas::yields::Mutex;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }
}
