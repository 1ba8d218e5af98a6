//! Mutual exclusion primitives for cooperatively scheduled lightweight
//! tasks.
//!
//! This crate implements the classic spinlock family - test-and-set (TAS),
//! test-and-test-and-set (TTAS), and the FIFO queue locks of Mellor-Crummey
//! and Scott (MCS) and of Craig and Landin-Hagersten (CLH) - tuned for tasks
//! that run M:N on top of a cooperative scheduler rather than directly on
//! kernel threads. The main properties of the queue locks are:
//!
//! - guaranteed FIFO ordering of lock acquisitions;
//! - waiters spin on locally-accessible flag variables only, decomposing
//!   contention across cache lines instead of hammering the lock word;
//! - a small constant amount of space per lock, plus one heap node per
//!   in-flight acquisition.
//!
//! ## Waiting flavors
//!
//! Each algorithm comes in a plain busy-spinning flavor and in cooperative
//! flavors that give the worker back to the scheduler while the lock stays
//! contended: exponential backoff that escalates to a yield, and a pure
//! yield-while wait. See [`relax`] for the policies and [`raw`] for the
//! per-algorithm type aliases.
//!
//! ## The task runtime
//!
//! The locks talk to the scheduler through the narrow facade in [`runtime`]:
//! task identity, one pointer-sized per-task payload (which carries the
//! queue-lock waiter nodes across suspensions and worker migrations), and
//! cooperative yielding. Out of the box the facade is backed by a
//! collaborator that maps each task onto one OS thread; embedders install
//! their own runtime once at startup with [`runtime::set_runtime`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! // A FIFO lock that spins during contention.
//! use tasklock::raw::mcs::spins::Mutex;
//!
//! let mutex = Arc::new(Mutex::new(0));
//! let c_mutex = Arc::clone(&mutex);
//!
//! thread::spawn(move || {
//!     *c_mutex.lock() = 10;
//! })
//! .join().expect("thread::spawn failed");
//!
//! assert_eq!(*mutex.lock(), 10);
//! ```
//!
//! ## Spinlock use cases
//!
//! It is noteworthy to mention that [spinlocks are usually not what you
//! want]. The majority of use cases are well covered by OS-based mutexes
//! like [`std::sync::Mutex`]. These implementations will notify the system
//! that the waiting thread should be parked, freeing the processor to work
//! on something else.
//!
//! Spinning pays off in the niche this crate targets: very short critical
//! sections, executed by lightweight tasks whose scheduler can be handed the
//! worker back through the cooperative flavors whenever contention persists.
//!
//! [spinlocks are usually not what you want]:
//!     https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::inline_always)]
#![allow(clippy::doc_markdown)]
#![warn(rust_2021_compatibility)]
#![warn(missing_docs)]

pub mod raw;
pub mod relax;
pub mod runtime;

pub(crate) mod broker;
pub(crate) mod cfg;

#[cfg(all(test, not(loom)))]
pub(crate) mod test;

#[cfg(all(loom, test))]
pub(crate) mod loom;
