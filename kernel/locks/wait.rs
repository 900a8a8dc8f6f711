// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the blocking primitive used by synchronisable
//! objects.
//!
//! A [`WaitObject`] parks callers until it is signalled. Waking
//! comes in two flavours: [`signal_one`](WaitObject::signal_one)
//! releases a single waiter, and [`signal_all`](WaitObject::signal_all)
//! releases every thread waiting at that moment.
//!
//! Until the scheduler exists, parking is a spin on the object's
//! generation counter; the scheduler will replace the inner loop
//! with a real block without changing the signalling contract.

use core::hint;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A blocking primitive that parks callers until signalled.
///
pub struct WaitObject {
    // Bumped by signal_all; a waiter that observes a
    // change is released.
    generation: AtomicU64,

    // Wake tokens granted by signal_one; a waiter that
    // claims a token is released.
    tokens: AtomicUsize,

    // The number of threads currently waiting.
    waiters: AtomicUsize,
}

impl WaitObject {
    /// Returns a new, unsignalled wait object.
    ///
    pub const fn new() -> Self {
        WaitObject {
            generation: AtomicU64::new(0),
            tokens: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Returns the number of threads currently waiting
    /// on the object.
    ///
    /// The value is advisory; it can change immediately.
    ///
    pub fn num_waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the object is
    /// signalled.
    ///
    pub fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        self.waiters.fetch_add(1, Ordering::AcqRel);

        loop {
            // A broadcast releases us.
            if self.generation.load(Ordering::Acquire) != generation {
                break;
            }

            // A single wake token releases us.
            if self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                    tokens.checked_sub(1)
                })
                .is_ok()
            {
                break;
            }

            hint::spin_loop();
        }

        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Releases one waiting thread.
    ///
    /// If no thread is waiting, the wake is retained and
    /// released to the next waiter.
    ///
    pub fn signal_one(&self) {
        self.tokens.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases every thread currently waiting on the
    /// object.
    ///
    pub fn signal_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for WaitObject {
    fn default() -> Self {
        Self::new()
    }
}
