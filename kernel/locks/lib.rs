// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's lock primitives.
//!
//! Three primitives are provided, from cheapest to most expensive:
//!
//! 1. [`SpinLock`]: a non-recursive busy-waiting lock that raises the
//!    interrupt priority to [`Irql::Dispatch`] for the duration of the
//!    guard, suppressing preemption. Critical sections under a spin
//!    lock must not block.
//! 2. [`Mutex`]: a sleepable lock. Acquisition spins for a bounded
//!    number of iterations and then blocks the calling thread on a
//!    [`WaitObject`] until the holder releases. The owner is recorded;
//!    recursive acquisition and release by a non-owner are rejected.
//! 3. [`WaitObject`]: the blocking primitive underneath the mutex and
//!    any other synchronisable object, with wake-one and wake-all
//!    signalling.
//!
//! Locking a [`SpinLock`] is done with the [`lock!`] macro, which
//! records the call site so that an apparent deadlock can report who
//! is holding the lock:
//!
//! ```ignore
//! static THING: SpinLock<Thing> = SpinLock::new(Thing::new());
//!
//! let thing = lock!(THING);
//! ```
//!
//! The interrupt priority model lives in [`irql`]. It is software
//! state: binding [`Irql::Dispatch`] and above to the hardware
//! interrupt flag is the interrupt controller glue's responsibility,
//! not this crate's.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

pub mod irql;
mod mutex;
mod spinlock;
mod wait;

pub use irql::Irql;
pub use mutex::{Mutex, MutexGuard, RawMutex};
#[doc(hidden)]
pub use spinlock::_lock;
pub use spinlock::{SpinLock, SpinLockGuard, MAX_LOCK_ATTEMPTS};
pub use wait::WaitObject;

use core::sync::atomic::{AtomicU64, Ordering};

/// Describes a failure to acquire or release a lock.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockError {
    /// The calling thread already holds the lock.
    RecursiveLock,

    /// The calling thread tried to release a lock
    /// held by another thread.
    NotOwner,
}

/// Identifies a thread of execution for lock ownership
/// purposes.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The thread that boots the kernel, before the
    /// scheduler starts.
    ///
    pub const BOOT: ThreadId = ThreadId(0);

    /// Returns a thread id with the given numerical
    /// value.
    ///
    pub const fn new(id: u64) -> Self {
        ThreadId(id)
    }

    /// Returns the id's numerical value.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The identity of the currently executing thread.
///
/// The scheduler installs the new identity on every context
/// switch. Until it starts, everything runs as [`ThreadId::BOOT`].
///
static CURRENT_THREAD: AtomicU64 = AtomicU64::new(0);

/// Returns the identity of the currently executing thread.
///
#[cfg(not(test))]
pub fn current_thread() -> ThreadId {
    ThreadId(CURRENT_THREAD.load(Ordering::Acquire))
}

/// Returns the identity of the currently executing thread.
///
/// In the test build each host thread gets its own identity,
/// as each CPU's scheduler would provide in the kernel proper.
///
#[cfg(test)]
pub fn current_thread() -> ThreadId {
    identity::current()
}

/// Installs the identity of the currently executing thread.
///
/// This is called by the scheduler on context switch.
///
pub fn set_current_thread(thread: ThreadId) {
    CURRENT_THREAD.store(thread.0, Ordering::Release);
}
