// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks the CPU's interrupt priority level.
//!
//! The interrupt priority level (IRQL) records what the processor is
//! currently allowed to be interrupted by. Thread preemption happens
//! at [`Irql::Dispatch`], so code that raises to `Dispatch` or above
//! cannot be preempted and must not block.
//!
//! Raising must not lower: [`raise`] returns the previous level, which
//! is later handed back to [`lower`], in the reverse order of raising.
//! The level is software state; masking hardware interrupt sources
//! when the level reaches [`Irql::Dispatch`] or above is the interrupt
//! controller glue's responsibility, as is diagnosing mismatched
//! raise/lower pairs.

use core::sync::atomic::{AtomicU8, Ordering};

/// An interrupt priority level.
///
/// The numerical value grows with the priority; a processor at level
/// `n` only takes interrupts with a level greater than `n`.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum Irql {
    /// Normal thread execution.
    Passive = 0,

    /// Asynchronous procedure calls.
    Apc = 1,

    /// The dispatcher; thread preemption is suppressed.
    Dispatch = 2,

    /// Device interrupt handlers.
    Device = 3,

    /// Nothing can interrupt the processor.
    High = 4,
}

impl Irql {
    /// Returns the level with the given numerical value.
    ///
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Irql::Passive,
            1 => Irql::Apc,
            2 => Irql::Dispatch,
            3 => Irql::Device,
            _ => Irql::High,
        }
    }
}

/// The current interrupt priority level.
///
static CURRENT_IRQL: AtomicU8 = AtomicU8::new(Irql::Passive as u8);

/// Returns the current interrupt priority level.
///
pub fn current() -> Irql {
    Irql::from_u8(CURRENT_IRQL.load(Ordering::Acquire))
}

/// Raises the interrupt priority level to `new`, returning the
/// previous level.
///
/// The priority is dropped again by handing the returned value
/// back to [`lower`]. Callers must not use `raise` to lower the
/// priority.
///
pub fn raise(new: Irql) -> Irql {
    Irql::from_u8(CURRENT_IRQL.swap(new as u8, Ordering::AcqRel))
}

/// Restores the interrupt priority level returned by a previous
/// call to [`raise`].
///
pub fn lower(old: Irql) {
    CURRENT_IRQL.store(old as u8, Ordering::Release);
}
