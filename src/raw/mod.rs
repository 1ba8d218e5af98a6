//! The lock families.
//!
//! Four algorithms, all exposing the same locking surface (`new`, `lock`,
//! `lock_with`, RAII guards) and all generic over a waiting strategy from
//! [`crate::relax`]:
//!
//! - [`tas`]: test-and-set. One atomic word, unfair, cheapest uncontended.
//! - [`ttas`]: test-and-test-and-set. Same contracts as TAS, but waiters
//!   probe with plain loads so the lock word can stay in shared cache state.
//! - [`mcs`]: Mellor-Crummey and Scott. FIFO queue lock; each waiter spins
//!   on its own node, released by its predecessor.
//! - [`clh`]: Craig / Landin-Hagersten. FIFO implicit-queue lock; each
//!   waiter spins on its *predecessor's* node.
//!
//! Every algorithm comes in three flavors, exposed as type-alias modules the
//! same way for each: `spins` (busy-wait with a CPU pause hint), with a
//! nested `spins::backoff` (exponential backoff escalating to cooperative
//! yields), and `yields` (wait through the task runtime's yield-while
//! primitive).
//!
//! The queue locks route their waiter nodes through the per-task broker and
//! therefore inherit its contract: one in-flight queue-lock acquisition per
//! task.

pub mod clh;
pub mod mcs;
pub mod tas;
pub mod ttas;
