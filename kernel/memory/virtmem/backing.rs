// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The seam between the virtual memory manager and the page cache.
//!
//! File-backed ranges need cached file content, but the cache and
//! its drivers live above this crate. [`FileBacking`] is the
//! contract a cache implements so the memory manager can populate
//! and share its frames; [`FileView`] is the argument shape
//! [`Context::allocate`](crate::Context::allocate) consumes.

use crate::Error;
use alloc::sync::Arc;
use memory::{PhysFrame, VirtAddr};

/// Distinguishes faults resolved from memory already at hand from
/// faults that had to read from a device.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultType {
    /// Every page involved was already present; nothing was
    /// read from a device.
    Soft,

    /// At least one page had to be read from the backing
    /// device.
    Hard,
}

/// A record of one virtual mapping that consumes a file's cached
/// pages. The cache keeps these so that teardown and writeback can
/// find every mapping of its content.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappedRegion {
    /// The file byte offset at which the mapping starts.
    pub fileoff: usize,

    /// The number of file bytes mapped.
    pub size: usize,

    /// The virtual address of the mapping's first page.
    pub virt: VirtAddr,

    /// The id of the context owning the mapping.
    pub context: u64,
}

/// A provider of cached file content for file-backed mappings.
///
/// The page cache implements this for each file-like vnode. All
/// offsets are byte offsets into the file.
///
/// [`get_entry`](Self::get_entry), [`frame_at`](Self::frame_at)
/// and [`mark_dirty`](Self::mark_dirty) may sleep, so the memory
/// manager only calls them with no context spinlock held. The
/// index maintenance calls ([`attach_mapping`](Self::attach_mapping),
/// [`detach_mapping`](Self::detach_mapping),
/// [`note_private_mapping`](Self::note_private_mapping)) and
/// [`cached_frame`](Self::cached_frame) must not sleep.
///
pub trait FileBacking: Send + Sync {
    /// Returns the file's size in bytes.
    ///
    fn file_size(&self) -> usize;

    /// Ensures that every page covering `[offset, offset + size)`
    /// is cached, reading from the device as needed.
    ///
    fn get_entry(&self, offset: usize, size: usize) -> Result<FaultType, Error>;

    /// Ensures the page covering `offset` is cached and returns
    /// the physical frame holding it.
    ///
    fn frame_at(&self, offset: usize) -> Result<(PhysFrame, FaultType), Error>;

    /// Returns the physical frame holding the page covering
    /// `offset`, only if the cache already holds it. Never
    /// sleeps, so it is safe under a context spinlock.
    ///
    fn cached_frame(&self, offset: usize) -> Option<PhysFrame>;

    /// Records that `[offset, offset + size)` has been written
    /// through a shared mapping and needs writing back.
    ///
    fn mark_dirty(&self, offset: usize, size: usize);

    /// Adds a mapping to the cache's reverse index, returning a
    /// handle for [`detach_mapping`](Self::detach_mapping).
    ///
    fn attach_mapping(&self, region: MappedRegion) -> u64;

    /// Removes a mapping from the cache's reverse index.
    ///
    fn detach_mapping(&self, id: u64);

    /// Notes that a private mapping now shares the cache's
    /// frames, so the cache's own span is copy-on-write.
    ///
    fn note_private_mapping(&self);
}

/// A file handle's view of itself, as consumed by
/// [`Context::allocate`](crate::Context::allocate).
///
/// The filesystem constructs this after checking that the handle
/// has a vnode of a mappable kind; the capability bits mirror how
/// the handle was opened.
///
#[derive(Clone)]
pub struct FileView {
    /// The provider of the file's cached content.
    pub backing: Arc<dyn FileBacking>,

    /// The byte offset into the file at which the mapping
    /// begins.
    pub offset: usize,

    /// Whether the handle was opened with read capability.
    pub read: bool,

    /// Whether the handle was opened with write capability.
    pub write: bool,
}
