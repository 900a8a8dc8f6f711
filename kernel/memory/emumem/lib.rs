// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Emulates physical memory for exercising memory-management code
//! in host tests.
//!
//! The memory manager accesses physical memory exclusively through
//! a virtual offset at which all of physical memory is mapped. That
//! indirection means it can run, unmodified, over *emulated*
//! physical memory: an arena of ordinary heap storage presented as
//! a small, synthetic physical address space, with the offset
//! chosen so that `offset + phys` lands inside the arena.
//!
//! [`EmulatedMemory`] builds such an arena. Its synthetic address
//! space starts at a small, stable address (so placement
//! constraints like "below 4 GiB" behave realistically), is
//! described by an ordinary boot memory map, and is served by the
//! real [`BitmapFrameAllocator`]. Page tables built over it are
//! real 4-level tables; frame contents are real bytes.
//!
//! The arena's storage is leaked, so frames and the structures
//! built over them remain valid for the rest of the test process.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use bootinfo::{FrameRange, MemoryMap, MemoryRegion, MemoryRegionType};
use memory::{phys_to_virt_addr_at, PhysAddr, PhysFrameSize, VirtAddr};
use physmem::{BitmapFrameAllocator, PageRegistry};

/// The synthetic physical address of the arena's first frame.
///
/// Starting above zero keeps the zero frame out of play, and the
/// 2 MiB alignment means huge frames in the arena are naturally
/// aligned in the synthetic space.
///
pub const PHYS_BASE: usize = 0x20_0000;

/// An arena of heap storage presented as a synthetic physical
/// address space.
///
#[derive(Clone, Copy)]
pub struct EmulatedMemory {
    host_base: usize,
    num_frames: usize,
}

impl EmulatedMemory {
    /// Builds an arena of `num_frames` 4 KiB frames.
    ///
    /// The backing storage is leaked, so everything built over
    /// the arena stays valid for the rest of the process.
    ///
    pub fn new(num_frames: usize) -> Self {
        let frame = PhysFrameSize::Size4KiB.bytes();
        let align = PhysFrameSize::Size2MiB.bytes();

        // Over-allocate so we can align the base to 2 MiB,
        // preserving frame alignment between the synthetic
        // and host views.
        let storage = vec![0u8; num_frames * frame + align].into_boxed_slice();
        let raw = Box::leak(storage).as_mut_ptr() as usize;
        let host_base = (raw + align - 1) & !(align - 1);

        EmulatedMemory {
            host_base,
            num_frames,
        }
    }

    /// Returns the offset at which the arena's synthetic
    /// physical memory can be accessed.
    ///
    /// This plays the role the kernel's physical memory
    /// mapping offset plays on real hardware.
    ///
    pub fn offset(&self) -> VirtAddr {
        VirtAddr::new(self.host_base - PHYS_BASE)
    }

    /// Returns a boot memory map describing the arena as a
    /// single usable region.
    ///
    pub fn memory_map(&self) -> MemoryMap {
        let frame = PhysFrameSize::Size4KiB.bytes();
        let mut map = MemoryMap::new();
        map.add_region(MemoryRegion {
            range: FrameRange::new(
                PHYS_BASE as u64,
                (PHYS_BASE + self.num_frames * frame) as u64,
            ),
            region_type: MemoryRegionType::Usable,
        });

        map
    }

    /// Returns a bitmap frame allocator serving the arena's
    /// frames.
    ///
    pub fn allocator(&self) -> BitmapFrameAllocator {
        let map = self.memory_map();
        unsafe { BitmapFrameAllocator::new(map.iter()) }
    }

    /// Returns a page registry drawing frames from the arena.
    ///
    pub fn registry(&self) -> PageRegistry {
        PageRegistry::new(Box::new(self.allocator()), self.offset())
    }

    /// Reads the byte at the given synthetic physical address.
    ///
    pub fn read_byte(&self, addr: PhysAddr) -> u8 {
        let virt = phys_to_virt_addr_at(addr, self.offset());
        unsafe { *(virt.as_usize() as *const u8) }
    }

    /// Writes the byte at the given synthetic physical address.
    ///
    pub fn write_byte(&self, addr: PhysAddr, value: u8) {
        let virt = phys_to_virt_addr_at(addr, self.offset());
        unsafe { *(virt.as_usize() as *mut u8) = value };
    }
}
