//! Switches between `core`/`std` primitives and their Loom instrumented
//! counterparts when testing under `--cfg loom`.

pub(crate) mod atomic {
    #[cfg(not(all(loom, test)))]
    pub(crate) use core::sync::atomic::{AtomicBool, AtomicPtr};

    #[cfg(all(loom, test))]
    pub(crate) use loom::sync::atomic::{AtomicBool, AtomicPtr};

    /// A trait for atomic loads that require exclusive access, and therefore
    /// no synchronization.
    pub(crate) trait UnsyncLoad {
        /// The type of the value stored by the atomic.
        type Target;

        /// Load the value without any synchronization.
        fn load_unsynced(&mut self) -> Self::Target;
    }

    #[cfg(not(all(loom, test)))]
    impl<T> UnsyncLoad for AtomicPtr<T> {
        type Target = *mut T;

        fn load_unsynced(&mut self) -> Self::Target {
            *self.get_mut()
        }
    }

    #[cfg(all(loom, test))]
    impl<T> UnsyncLoad for AtomicPtr<T> {
        type Target = *mut T;

        fn load_unsynced(&mut self) -> Self::Target {
            // SAFETY: We hold exclusive access through the `mut` reference.
            unsafe { self.unsync_load() }
        }
    }
}

pub(crate) mod cell {
    #[cfg(not(all(loom, test)))]
    pub(crate) use core::cell::UnsafeCell;

    #[cfg(all(loom, test))]
    pub(crate) use loom::cell::UnsafeCell;

    /// A trait for running closures against the value stored inside a
    /// [`UnsafeCell`], without any synchronization.
    pub(crate) trait WithUnchecked<T: ?Sized> {
        /// Runs `f` against a shared reference to the underlying data.
        ///
        /// # Safety
        ///
        /// Caller must guarantee there are no mutable aliases to the
        /// underlying data for the duration of the call.
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret;
    }

    #[cfg(not(all(loom, test)))]
    impl<T: ?Sized> WithUnchecked<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            f(unsafe { &*self.get() })
        }
    }

    #[cfg(all(loom, test))]
    impl<T: ?Sized> WithUnchecked<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            self.with(|ptr| f(unsafe { &*ptr }))
        }
    }
}

pub(crate) mod hint {
    #[cfg(not(all(loom, test)))]
    pub(crate) use core::hint::spin_loop;

    /// Loom cannot observe a raw spin hint; yielding instead lets the model
    /// scheduler run the thread being waited on.
    #[cfg(all(loom, test))]
    pub(crate) fn spin_loop() {
        loom::thread::yield_now();
    }
}

pub(crate) mod thread {
    #[cfg(not(all(loom, test)))]
    pub(crate) use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub(crate) use loom::thread::yield_now;
}
