// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a bootstrap frame allocator, used before the kernel's
//! heap is available.

use bootinfo::{MemoryMap, MemoryRegionType};
use memory::{PhysAddr, PhysFrame, PhysFrameAllocator, PhysFrameSize};

/// A basic physical memory allocator, used to bootstrap the
/// kernel's heap.
///
/// `BootInfoFrameAllocator` allocates frames sequentially from
/// the usable regions of the boot memory map. It cannot
/// de-allocate frames, so once the heap is up, the
/// [`BitmapFrameAllocator`](crate::BitmapFrameAllocator)
/// repossesses its allocations and takes over.
///
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Creates a bootstrap allocator from the passed memory map.
    ///
    /// # Safety
    ///
    /// This function is unsafe because the caller must guarantee
    /// that the memory map is valid and complete. All frames that
    /// are marked `Usable` in the memory map must be unused.
    ///
    pub unsafe fn new(memory_map: &'static MemoryMap) -> Self {
        BootInfoFrameAllocator {
            memory_map,
            next: 0,
        }
    }

    /// Returns the memory map the allocator draws from.
    ///
    pub fn underlying_map(&self) -> &'static MemoryMap {
        self.memory_map
    }

    /// Returns an iterator over the usable frames in the
    /// memory map.
    ///
    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.memory_map
            .iter()
            .filter(|region| region.region_type == MemoryRegionType::Usable)
            .map(|region| region.range.start_addr()..region.range.end_addr())
            .flat_map(|region| region.step_by(PhysFrameSize::Size4KiB.bytes()))
            .map(|addr| {
                PhysFrame::from_start_address(
                    PhysAddr::new(addr as usize),
                    PhysFrameSize::Size4KiB,
                )
                .expect("unaligned usable region in memory map")
            })
    }

    /// Returns an iterator over the frames this allocator has
    /// already handed out.
    ///
    pub fn used_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.usable_frames().take(self.next)
    }
}

unsafe impl PhysFrameAllocator for BootInfoFrameAllocator {
    /// Returns the next available physical frame, or `None`.
    ///
    fn allocate_phys_frame(&mut self, size: PhysFrameSize) -> Option<PhysFrame> {
        if size != PhysFrameSize::Size4KiB {
            return None;
        }

        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }

    /// The bootstrap allocator cannot honour placement
    /// constraints.
    ///
    fn allocate_phys_frame_below(
        &mut self,
        _size: PhysFrameSize,
        _limit: PhysAddr,
    ) -> Option<PhysFrame> {
        None
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use bootinfo::{FrameRange, MemoryRegion};
    use std::boxed::Box;

    #[test]
    fn test_bootstrap_allocation() {
        let mut map = MemoryMap::new();
        map.add_region(MemoryRegion {
            range: FrameRange::new(0x1000, 0x3000),
            region_type: MemoryRegionType::Reserved,
        });
        map.add_region(MemoryRegion {
            range: FrameRange::new(0x3000, 0x5000),
            region_type: MemoryRegionType::Usable,
        });

        // The map must be 'static, so we leak it, as the
        // bootloader's map would be.
        let map: &'static MemoryMap = Box::leak(Box::new(map));
        let mut alloc = unsafe { BootInfoFrameAllocator::new(map) };

        let size = PhysFrameSize::Size4KiB;
        fn frame_for(addr: usize) -> PhysFrame {
            PhysFrame::from_start_address(PhysAddr::new(addr), PhysFrameSize::Size4KiB).unwrap()
        }

        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x3000)));
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x4000)));
        assert_eq!(alloc.allocate_phys_frame(size), None);

        let used: std::vec::Vec<PhysFrame> = alloc.used_frames().collect();
        assert_eq!(used, std::vec![frame_for(0x3000), frame_for(0x4000)]);
    }
}
