// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Virtual memory management: address space contexts, page ranges,
//! and demand paging.
//!
//! Each process owns a [`Context`]: a page table plus an ordered
//! tree of [`PageRange`]s describing what each span of its virtual
//! address space means. The kernel has a context of its own, which
//! allocates from the [`KERNEL_DYNAMIC`](memory::constants::KERNEL_DYNAMIC)
//! region.
//!
//! The operations on a context are:
//!
//! - [`Context::allocate`]: carve out a new range, optionally at a
//!   fixed base, backed by nothing (a reservation), by demand-zero
//!   anonymous memory, by eagerly allocated frames, or by a file
//!   through the page cache.
//! - [`Context::free`]: release part or all of a range, splitting
//!   it as needed.
//! - [`Context::protect`]: change the protection of part or all of
//!   a range, splitting it as needed.
//! - [`Context::fault`]: resolve a page fault against the range
//!   metadata, performing demand-zero, page-in, copy-on-write and
//!   dirty-tracking transitions.
//! - [`Context::read_bytes`] / [`Context::write_bytes`]: transfer
//!   bytes between a context's virtual memory and a kernel buffer,
//!   resolving faults the way a CPU access would.
//!
//! Anonymous memory starts out backed by the page registry's pinned
//! zero frame, parked in non-present page table entries; the first
//! read maps it shared and read-only, and the first write peels off
//! a private zeroed frame. Private file mappings work the same way
//! against the page cache's frames, with both sides read-only until
//! one of them writes. Shared file mappings are installed
//! write-protected even when writable so that the first write per
//! page can record a dirty region for writeback.
//!
//! File content is supplied through the [`FileBacking`] trait, which
//! the filesystem's page cache implements; this crate never talks to
//! a driver directly.

#![no_std]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod backing;
mod context;
mod fault;
mod range;

pub use backing::{FaultType, FileBacking, FileView, MappedRegion};
pub use context::{Context, ContextKind, MemoryStats};
pub use fault::AccessKind;
pub use range::{CowMode, MappedFile, PageRange, RangeTree};

use bitflags::bitflags;
use core::fmt;

/// Describes a failed virtual memory operation.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// A parameter was malformed: a misaligned base, a zero
    /// size, an unsupported flag combination, or a file that
    /// cannot be mapped.
    InvalidArgument,

    /// The file handle has no underlying vnode.
    Uninitialized,

    /// The caller lacks the capability the operation needs,
    /// or an access violated the protection of the memory it
    /// touched.
    AccessDenied,

    /// The requested virtual addresses collide with an
    /// existing range.
    InUse,

    /// No physical frames, or no suitable gap in the virtual
    /// address space.
    NotEnoughMemory,

    /// The given addresses lie in no known range.
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Uninitialized => write!(f, "file is not initialised"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::InUse => write!(f, "virtual addresses already in use"),
            Error::NotEnoughMemory => write!(f, "not enough memory"),
            Error::NotFound => write!(f, "no such range"),
        }
    }
}

bitflags! {
    /// Flags governing [`Context::allocate`].
    ///
    pub struct AllocFlags: u32 {
        /// Reserve the address space without backing it.
        /// Later allocations inside the reservation commit
        /// it piecemeal. Any file is ignored.
        const RESERVE = 1 << 0;

        /// Allocate frames now rather than on first touch,
        /// and exclude the memory from swap. Cannot be
        /// combined with a file mapping.
        const NON_PAGED = 1 << 1;

        /// Use 2 MiB pages when the allocator can supply
        /// them. Falls back to 4 KiB granularity otherwise.
        /// Only honoured for non-paged and reserved
        /// allocations.
        const HUGE_PAGE = 1 << 2;

        /// Warm the page cache for the mapped window
        /// immediately.
        const PREFAULT = 1 << 3;

        /// Map the file privately: writes peel off copies
        /// and never reach the file.
        const PRIVATE = 1 << 4;

        /// Allocate one extra leading page that is kept
        /// permanently non-present, and return the address
        /// after it.
        const GUARD_PAGE = 1 << 5;

        /// The requested base is a hint: on collision,
        /// choose a fresh base instead of failing.
        const HINT = 1 << 6;

        /// Place the range in the low 32-bit window of the
        /// virtual address space.
        const VIRT32 = 1 << 7;

        /// Back the range with frames below 4 GiB. Cannot
        /// be combined with a file mapping.
        const PHYS32 = 1 << 8;
    }
}

bitflags! {
    /// The caller-facing protection bits consumed by
    /// [`Context::allocate`] and [`Context::protect`].
    ///
    /// The empty value is ordinary writable, non-executable,
    /// kernel-only memory.
    ///
    pub struct ProtFlags: u32 {
        /// The memory cannot be written.
        const READ_ONLY = 1 << 0;

        /// The memory can be executed.
        const EXECUTABLE = 1 << 1;

        /// The memory is accessible from ring 3.
        const USER = 1 << 2;

        /// Accesses bypass the cache.
        const CACHE_DISABLE = 1 << 3;

        /// Accesses use the cache. Only meaningful with
        /// [`SAME_AS_BEFORE`](Self::SAME_AS_BEFORE), to undo
        /// a previous [`CACHE_DISABLE`](Self::CACHE_DISABLE).
        const CACHE_ENABLE = 1 << 4;

        /// In [`Context::protect`], update only the bits
        /// that are set rather than replacing the whole
        /// protection.
        const SAME_AS_BEFORE = 1 << 5;
    }
}
