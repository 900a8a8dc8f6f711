// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management and allocation.
//!
//! This crate has two halves: frame allocation and the page
//! registry.
//!
//! Frame allocation consists of two allocators:
//!
//! 1. [`BootInfoFrameAllocator`], which hands out frames before the heap exists.
//! 2. [`BitmapFrameAllocator`], which takes over from the bootstrap allocator for subsequent use.
//!
//! The bootstrap allocator (constructed using [`bootstrap`])
//! uses the memory map provided by the bootloader to identify
//! a series of available physical memory frames and allocate
//! them sequentially. This is only intended for early use and
//! cannot de-allocate the frames it allocates.
//!
//! Once the kernel heap is initialised, we switch over to the
//! second-phase allocator in [`init`], which takes ownership
//! of the memory map from the bootstrap allocator, including
//! the frames it has already allocated. From that point onwards,
//! we only use the bitmap allocator, which can de-allocate
//! frames and can produce 2 MiB frames from aligned free runs.
//!
//! The [`PageRegistry`] is the catalogue of data frames: every
//! frame that backs a virtual mapping has a reference-counted
//! [`PhysicalPage`] record here, keyed by its physical address.
//! Mapping code takes a reference before installing a frame and
//! drops it when tearing the mapping down; a frame whose count
//! reaches zero is returned to the allocator. The registry also
//! owns the pinned, shared zero frame that backs anonymous
//! memory until first write.
//!
//! The kernel's registry is the [`struct@REGISTRY`] static,
//! initialised with [`init`]; the helper functions
//! [`allocate_phys_frame`] and [`deallocate_phys_frame`] reach
//! its allocator directly for callers that need raw frames,
//! such as page-table construction. The [`debug`] function
//! prints the allocator's state.

#![no_std]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod bitmap;
mod boot_info;
mod registry;

pub use crate::bitmap::BitmapFrameAllocator;
pub use crate::boot_info::BootInfoFrameAllocator;
pub use crate::registry::{AllocateOptions, FrameSource, PageRegistry, PhysicalPage};

use alloc::boxed::Box;
use bootinfo::MemoryMap;
use lazy_static::lazy_static;
use memory::{PhysFrame, PhysFrameAllocator, PhysFrameDeallocator, PhysFrameSize};

lazy_static! {
    /// The kernel's page registry, owning the second-phase
    /// physical memory allocator.
    ///
    /// `REGISTRY` starts out empty and unable to allocate;
    /// it is brought up by calling [`init`], once the
    /// kernel's heap has been set up. To bootstrap the heap,
    /// use [`bootstrap`] to build a [`BootInfoFrameAllocator`],
    /// then pass that to [`init`] so `REGISTRY` can take over.
    ///
    pub static ref REGISTRY: PageRegistry = PageRegistry::empty();
}

/// Sets up the second-phase physical memory manager, taking over
/// from the bootstrap allocator.
///
/// # Safety
///
/// The `bootstrap` allocator passed to `init` must have sole control
/// over all physical memory it describes. If any physical memory is
/// being used but is marked as available in `bootstrap`, then undefined
/// behaviour may ensue.
///
pub unsafe fn init(bootstrap: BootInfoFrameAllocator) {
    let mut alloc = BitmapFrameAllocator::new(bootstrap.underlying_map().iter());
    alloc.repossess(bootstrap);

    REGISTRY.install(Box::new(alloc));
}

/// Returns the next available physical frame, or `None`.
///
/// The frame is not entered into the page registry; this is for
/// raw consumers such as page-table construction. Frames that
/// back virtual mappings are allocated with
/// [`PageRegistry::allocate`] instead.
///
/// If `allocate_phys_frame` is called before [`init`], it will
/// return `None`.
///
pub fn allocate_phys_frame(size: PhysFrameSize) -> Option<PhysFrame> {
    let mut allocator = &*REGISTRY;
    allocator.allocate_phys_frame(size)
}

/// Marks the given physical memory frame as unused and returns it to the
/// list of free frames for later use.
///
/// # Safety
///
/// The caller must ensure that `frame` is unused.
///
pub unsafe fn deallocate_phys_frame(frame: PhysFrame) {
    let mut allocator = &*REGISTRY;
    allocator.deallocate_phys_frame(frame);
}

/// Prints debug information about the physical memory manager.
///
pub fn debug() {
    REGISTRY.debug();
}

/// Returns an initial frame allocator, which can be used to allocate the
/// the kernel's heap.
///
/// Once the kernel's heap has been initialised, the kernel should switch
/// over to the full allocator, by calling [`init`].
///
/// # Safety
///
/// This function is unsafe because the caller must guarantee that the
/// memory map is valid and complete. All frames that are marked as `USABLE`
/// in the memory map must be unused.
///
/// `bootstrap` must be called at most once, and must not be called after
/// a call to [`init`].
///
pub unsafe fn bootstrap(memory_map: &'static MemoryMap) -> BootInfoFrameAllocator {
    BootInfoFrameAllocator::new(memory_map)
}
