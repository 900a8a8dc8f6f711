// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a bitmap frame allocator, which can be used to allocate
//! and deallocate physical memory frames.

use crate::boot_info::BootInfoFrameAllocator;
use alloc::vec::Vec;
use bitmap_index::Bitmap;
use bootinfo::{MemoryRegion, MemoryRegionType};
use core::slice::Iter;
use memory::{
    PhysAddr, PhysFrame, PhysFrameAllocator, PhysFrameDeallocator, PhysFrameRange, PhysFrameSize,
};
use pretty::Bytes;
use serial::println;

/// The number of 4 KiB frames in a 2 MiB frame.
///
const FRAMES_PER_HUGE_FRAME: usize =
    PhysFrameSize::Size2MiB.bytes() / PhysFrameSize::Size4KiB.bytes();

/// A single contiguous chunk of physical memory, which is
/// tracked using a bitmap.
///
struct BitmapPool {
    // start_address is the address of the first
    // frame in the pool. start_address is guaranteed
    // to be frame-aligned.
    //
    pub start_address: PhysAddr,

    // last_address is the largest address that is
    // within the pool.
    //
    pub last_address: PhysAddr,

    // num_frames is the number of 4 KiB frames in
    // this pool.
    //
    pub num_frames: usize,

    // free_frames is the number of 4 KiB frames in
    // this pool that have not been allocated. There
    // is no guarantee that the free frames will be
    // consecutive.
    //
    pub free_frames: usize,

    // bitmap is a compact representation of the frames
    // in this pool and whether each is free. For frame
    // n (where the frame with the starting address at
    // self.start_address is frame 0), the nth bit in
    // bitmap will be 1 if the frame is free and 0 if
    // the frame has been allocated.
    //
    bitmap: Bitmap,
}

impl BitmapPool {
    /// new returns a BitmapPool representing the given
    /// memory region.
    ///
    pub fn new(region: &MemoryRegion) -> Self {
        if region.region_type != MemoryRegionType::Usable {
            panic!(
                "cannot make new frame pool from memory region with non-Usable type {:?}",
                region.region_type
            );
        }

        let num_frames = region.range.end_frame_number - region.range.start_frame_number;
        BitmapPool {
            start_address: PhysAddr::new(region.range.start_addr() as usize),
            last_address: PhysAddr::new(region.range.end_addr() as usize - 1),
            num_frames: num_frames as usize,
            free_frames: num_frames as usize,
            bitmap: Bitmap::new_set(num_frames as usize),
        }
    }

    /// frame_at returns the physical frame at the given
    /// index.
    ///
    fn frame_at(&self, index: usize) -> PhysFrame {
        let size = PhysFrameSize::Size4KiB;
        PhysFrame::from_start_address(self.start_address + index * size.bytes(), size).unwrap()
    }

    /// index_for returns the index at which the given
    /// physical address exists, or None.
    ///
    fn index_for(&self, addr: PhysAddr) -> Option<usize> {
        if addr < self.start_address || self.last_address < addr {
            return None;
        }

        Some((addr - self.start_address) / PhysFrameSize::Size4KiB.bytes())
    }

    /// contains_frame returns whether the pool includes
    /// the given frame.
    ///
    pub fn contains_frame(&self, frame: PhysFrame) -> bool {
        let start_addr = frame.start_address();
        self.start_address <= start_addr && start_addr < self.last_address
    }

    /// allocate_frame returns the next free frame,
    /// or None.
    ///
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }

        match self.bitmap.next_set() {
            None => None,
            Some(index) => {
                self.bitmap.unset(index);
                self.free_frames -= 1;
                Some(self.frame_at(index))
            }
        }
    }

    /// allocate_frame_below returns the next free frame
    /// whose every byte lies below `limit`, or None.
    ///
    pub fn allocate_frame_below(&mut self, limit: PhysAddr) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }

        let size = PhysFrameSize::Size4KiB;
        for index in 0..self.num_frames {
            if !self.bitmap.get(index) {
                continue;
            }

            let frame = self.frame_at(index);
            if frame.end_address().as_usize() >= limit.as_usize() {
                // Later frames only get higher.
                return None;
            }

            self.bitmap.unset(index);
            self.free_frames -= 1;
            debug_assert_eq!(frame.size(), size);
            return Some(frame);
        }

        None
    }

    /// allocate_huge_frame returns a free, naturally
    /// aligned 2 MiB frame, or None.
    ///
    pub fn allocate_huge_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames < FRAMES_PER_HUGE_FRAME {
            return None;
        }

        // The first index at which a frame is 2 MiB
        // aligned in physical memory.
        let huge = PhysFrameSize::Size2MiB.bytes();
        let misalign = self.start_address.as_usize() % huge;
        let first = if misalign == 0 {
            0
        } else {
            (huge - misalign) / PhysFrameSize::Size4KiB.bytes()
        };

        if self.num_frames < FRAMES_PER_HUGE_FRAME + first {
            return None;
        }

        let mut base = first;
        'search: while base + FRAMES_PER_HUGE_FRAME <= self.num_frames {
            for i in 0..FRAMES_PER_HUGE_FRAME {
                if !self.bitmap.get(base + i) {
                    base += FRAMES_PER_HUGE_FRAME;
                    continue 'search;
                }
            }

            for i in 0..FRAMES_PER_HUGE_FRAME {
                self.bitmap.unset(base + i);
            }

            self.free_frames -= FRAMES_PER_HUGE_FRAME;
            let addr = self.start_address + base * PhysFrameSize::Size4KiB.bytes();
            return Some(PhysFrame::from_start_address(addr, PhysFrameSize::Size2MiB).unwrap());
        }

        None
    }

    /// allocate_n_frames returns n sequential free frames,
    /// or None.
    ///
    pub fn allocate_n_frames(&mut self, n: usize) -> Option<PhysFrameRange> {
        if n == 0 || self.free_frames < n {
            return None;
        }

        match self.bitmap.next_n_set(n) {
            None => None,
            Some(index) => {
                for i in 0..n {
                    self.bitmap.unset(index + i);
                }

                self.free_frames -= n;
                let start = self.frame_at(index);
                let end = self.frame_at(index + n);
                Some(PhysFrame::range_exclusive(start, end))
            }
        }
    }

    /// mark_frame_allocated marks the given frame as
    /// allocated.
    ///
    pub fn mark_frame_allocated(&mut self, frame: PhysFrame) {
        let start_addr = frame.start_address();
        match self.index_for(start_addr) {
            None => panic!("cannot mark frame at {:p}: frame not tracked", start_addr),
            Some(i) => {
                if !self.bitmap.get(i) {
                    panic!(
                        "cannot mark frame at {:p}: frame already marked allocated",
                        start_addr
                    );
                }

                self.bitmap.unset(i);
                self.free_frames -= 1;
            }
        }
    }

    /// deallocate_frame marks the given frame as free
    /// for use.
    ///
    /// Frames of either size can be returned; a 2 MiB
    /// frame frees all of its 4 KiB constituents.
    ///
    pub fn deallocate_frame(&mut self, frame: PhysFrame) {
        let start_addr = frame.start_address();
        let frames = frame.size().bytes() / PhysFrameSize::Size4KiB.bytes();
        match self.index_for(start_addr) {
            None => panic!(
                "cannot deallocate frame at {:p}: frame not tracked",
                start_addr
            ),
            Some(i) => {
                for n in i..i + frames {
                    if self.bitmap.get(n) {
                        panic!(
                            "cannot deallocate frame at {:p}: frame already free",
                            start_addr
                        );
                    }

                    self.bitmap.set(n);
                }

                self.free_frames += frames;
            }
        }
    }
}

/// A more sophisticated physical memory allocator.
///
/// `BitmapFrameAllocator` takes over from the [`BootInfoFrameAllocator`](crate::BootInfoFrameAllocator)
/// once the kernel's heap has been initialised.
///
pub struct BitmapFrameAllocator {
    // num_frames is the number of 4 KiB frames
    // tracked by this allocator.
    //
    pub num_frames: usize,

    // free_frames is the number of 4 KiB frames
    // that have not been allocated. There is no
    // guarantee that the free frames will be
    // consecutive.
    //
    pub free_frames: usize,

    // pools contains the bitmap data for each pool
    // of contiguous frames.
    //
    pools: Vec<BitmapPool>,
}

impl BitmapFrameAllocator {
    /// Returns an empty allocator, which can allocate no memory.
    ///
    pub const fn empty() -> Self {
        BitmapFrameAllocator {
            num_frames: 0,
            free_frames: 0,
            pools: Vec::new(),
        }
    }

    /// Creates a BitmapFrameAllocator from the passed memory regions.
    ///
    /// # Safety
    ///
    /// This function is unsafe because the caller must guarantee that the
    /// memory map is valid and complete. All frames that are marked as
    /// `Usable` in the memory map must be unused.
    ///
    pub unsafe fn new(regions: Iter<MemoryRegion>) -> Self {
        // Start out by determining the set of
        // available pools.
        let usable_regions = regions.filter(|r| {
            r.region_type == MemoryRegionType::Usable
                && r.range.start_frame_number < r.range.end_frame_number
        });

        let pools: Vec<BitmapPool> = usable_regions.map(BitmapPool::new).collect();
        let mut num_frames = 0;
        let mut free_frames = 0;
        for pool in pools.iter() {
            num_frames += pool.num_frames;
            free_frames += pool.free_frames;
        }

        BitmapFrameAllocator {
            num_frames,
            free_frames,
            pools,
        }
    }

    /// Returns `n` sequential free frames, or `None`.
    ///
    /// It's possible that `n` frames may be available, but `allocate_n_frames`
    /// still return `None`. The bitmap allocator must be able to return `n`
    /// frames in a single contiguous sequence for it to succeed.
    ///
    pub fn allocate_n_frames(&mut self, n: usize) -> Option<PhysFrameRange> {
        for pool in self.pools.iter_mut() {
            if let Some(range) = pool.allocate_n_frames(n) {
                self.free_frames -= n;
                return Some(range);
            }
        }

        None
    }

    /// Marks the given frame as already allocated.
    ///
    fn mark_frame_allocated(&mut self, frame: PhysFrame) {
        for pool in self.pools.iter_mut() {
            if pool.contains_frame(frame) {
                pool.mark_frame_allocated(frame);
                self.free_frames -= 1;
                return;
            }
        }

        let start_addr = frame.start_address();
        panic!("cannot mark frame at {:p}: frame not tracked", start_addr);
    }

    /// Takes ownership of the given [`BootInfoFrameAllocator`](crate::BootInfoFrameAllocator),
    /// along with any frames it has already allocated, allowing them to be freed using
    /// `deallocate_phys_frame`.
    ///
    /// # Safety
    ///
    /// This function is unsafe because the caller must guarantee that the
    /// memory map is valid and complete. All frames that are marked as
    /// `Usable` in the memory map must be unused.
    ///
    pub unsafe fn repossess(&mut self, alloc: BootInfoFrameAllocator) {
        for frame in alloc.used_frames() {
            self.mark_frame_allocated(frame);
        }
    }

    /// Prints debug information about the allocator's state.
    ///
    pub fn debug(&self) {
        println!(
            "Physical memory manager: {}/{} frames available.",
            self.free_frames, self.num_frames
        );
        println!(
            "{} used, {} free, {} total",
            Bytes::from_usize((self.num_frames - self.free_frames) * 4096),
            Bytes::from_usize(self.free_frames * 4096),
            Bytes::from_usize(self.num_frames * 4096)
        );
        for pool in self.pools.iter() {
            println!(
                "{:#011x}-{:#011x} {:5} x {} frame = {:7}, {:5} x free frames = {:7}",
                pool.start_address,
                pool.last_address,
                pool.num_frames,
                Bytes::from_usize(4096),
                Bytes::from_usize(4096 * pool.num_frames),
                pool.free_frames,
                Bytes::from_usize(pool.free_frames * 4096)
            );
        }
    }
}

unsafe impl PhysFrameAllocator for BitmapFrameAllocator {
    /// Returns the next available physical frame, or `None`.
    ///
    /// A 2 MiB request is satisfied from a naturally aligned
    /// run of free 4 KiB frames, if one exists.
    ///
    fn allocate_phys_frame(&mut self, size: PhysFrameSize) -> Option<PhysFrame> {
        match size {
            PhysFrameSize::Size4KiB => {
                for pool in self.pools.iter_mut() {
                    if let Some(frame) = pool.allocate_frame() {
                        self.free_frames -= 1;
                        return Some(frame);
                    }
                }

                None
            }
            PhysFrameSize::Size2MiB => {
                for pool in self.pools.iter_mut() {
                    if let Some(frame) = pool.allocate_huge_frame() {
                        self.free_frames -= FRAMES_PER_HUGE_FRAME;
                        return Some(frame);
                    }
                }

                None
            }
            PhysFrameSize::Size1GiB => None,
        }
    }

    /// Returns the next available physical frame below the
    /// given address limit, or `None`.
    ///
    fn allocate_phys_frame_below(
        &mut self,
        size: PhysFrameSize,
        limit: PhysAddr,
    ) -> Option<PhysFrame> {
        if size != PhysFrameSize::Size4KiB {
            return None;
        }

        for pool in self.pools.iter_mut() {
            if pool.start_address >= limit {
                continue;
            }

            if let Some(frame) = pool.allocate_frame_below(limit) {
                self.free_frames -= 1;
                return Some(frame);
            }
        }

        None
    }
}

impl PhysFrameDeallocator for BitmapFrameAllocator {
    /// Marks the given physical memory frame as unused and returns it to the
    /// list of free frames for later use.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `frame` is unused.
    ///
    unsafe fn deallocate_phys_frame(&mut self, frame: PhysFrame) {
        if frame.size() == PhysFrameSize::Size1GiB {
            panic!("cannot deallocate {:?}: frame not tracked", frame);
        }

        let frames = frame.size().bytes() / PhysFrameSize::Size4KiB.bytes();
        for pool in self.pools.iter_mut() {
            if pool.contains_frame(frame) {
                pool.deallocate_frame(frame);
                self.free_frames += frames;
                return;
            }
        }

        let start_addr = frame.start_address();
        panic!(
            "cannot deallocate frame at {:p}: frame not tracked",
            start_addr
        );
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use bootinfo::FrameRange;

    fn regions() -> [MemoryRegion; 5] {
        [
            MemoryRegion {
                range: FrameRange {
                    start_frame_number: 0u64,
                    end_frame_number: 1u64,
                },
                region_type: MemoryRegionType::FrameZero,
            },
            MemoryRegion {
                range: FrameRange {
                    start_frame_number: 1u64,
                    end_frame_number: 4u64,
                },
                region_type: MemoryRegionType::Reserved,
            },
            MemoryRegion {
                range: FrameRange {
                    start_frame_number: 4u64,
                    end_frame_number: 8u64,
                },
                region_type: MemoryRegionType::Usable,
            },
            MemoryRegion {
                range: FrameRange {
                    start_frame_number: 8u64,
                    end_frame_number: 12u64,
                },
                region_type: MemoryRegionType::Reserved,
            },
            MemoryRegion {
                range: FrameRange {
                    start_frame_number: 12u64,
                    end_frame_number: 14u64,
                },
                region_type: MemoryRegionType::Usable,
            },
        ]
    }

    // Helper function to speed up making frames.
    fn frame_for(addr: usize) -> PhysFrame {
        let start_addr = PhysAddr::new(addr);
        let size = PhysFrameSize::Size4KiB;
        PhysFrame::from_start_address(start_addr, size).unwrap()
    }

    #[test]
    fn test_bitmap_frame_allocator() {
        let regions = regions();
        let mut alloc = unsafe { BitmapFrameAllocator::new(regions.iter()) };
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 6);

        let size = PhysFrameSize::Size4KiB;

        // Do some allocations.
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x4000)));
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 5);
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x5000)));
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 4);

        // Do a free.
        unsafe { alloc.deallocate_phys_frame(frame_for(0x4000)) };
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 5);

        // Next allocation should return the address we just freed.
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x4000)));
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 4);

        // Check that all remaining allocations are as we expect.
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x6000)));
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x7000)));
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0xc000)));
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0xd000)));
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 0);

        // Check that we get nothing once we run out of frames.
        assert_eq!(alloc.allocate_phys_frame(size), None);
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 0);

        // Check that sequential allocations work correctly.

        // Deallocate 2 non-sequential frames, expect None.
        unsafe { alloc.deallocate_phys_frame(frame_for(0x5000)) };
        unsafe { alloc.deallocate_phys_frame(frame_for(0x7000)) };
        assert_eq!(alloc.allocate_n_frames(2), None);

        // Leave 2 sequential frames, check we get the right pair.
        assert_eq!(alloc.allocate_phys_frame(size), Some(frame_for(0x5000)));
        unsafe { alloc.deallocate_phys_frame(frame_for(0x6000)) };
        assert_eq!(
            alloc.allocate_n_frames(2),
            Some(PhysFrame::range_exclusive(
                frame_for(0x6000),
                frame_for(0x8000)
            ))
        );

        // Check that we get nothing once we run out of frames.
        assert_eq!(alloc.num_frames, 6);
        assert_eq!(alloc.free_frames, 0);
    }

    #[test]
    fn test_allocate_below() {
        let regions = regions();
        let mut alloc = unsafe { BitmapFrameAllocator::new(regions.iter()) };

        // Only the first pool lies below 0x8000.
        let size = PhysFrameSize::Size4KiB;
        let limit = PhysAddr::new(0x8000);
        assert_eq!(
            alloc.allocate_phys_frame_below(size, limit),
            Some(frame_for(0x4000))
        );
        assert_eq!(
            alloc.allocate_phys_frame_below(size, limit),
            Some(frame_for(0x5000))
        );

        // A limit inside a frame excludes that frame.
        assert_eq!(
            alloc.allocate_phys_frame_below(size, PhysAddr::new(0x6800)),
            None
        );

        assert_eq!(alloc.free_frames, 4);
    }

    #[test]
    fn test_allocate_huge_frame() {
        // A pool of 1040 x 4 KiB frames, starting at
        // 1 MiB, so the first 2 MiB boundary falls 256
        // frames in.
        let regions = [MemoryRegion {
            range: FrameRange {
                start_frame_number: 256u64,
                end_frame_number: 1296u64,
            },
            region_type: MemoryRegionType::Usable,
        }];

        let mut alloc = unsafe { BitmapFrameAllocator::new(regions.iter()) };
        assert_eq!(alloc.free_frames, 1040);

        // The aligned run starts at 2 MiB, not at the
        // pool's first frame.
        let huge = alloc
            .allocate_phys_frame(PhysFrameSize::Size2MiB)
            .expect("huge frame");
        assert_eq!(huge.start_address(), PhysAddr::new(0x20_0000));
        assert_eq!(huge.size(), PhysFrameSize::Size2MiB);
        assert_eq!(alloc.free_frames, 1040 - 512);

        // The small frames before the boundary are still
        // available.
        let small = alloc.allocate_phys_frame(PhysFrameSize::Size4KiB).unwrap();
        assert_eq!(small.start_address(), PhysAddr::new(0x10_0000));

        // There is no second aligned run.
        assert_eq!(alloc.allocate_phys_frame(PhysFrameSize::Size2MiB), None);

        // Freeing the huge frame makes it available again.
        unsafe { alloc.deallocate_phys_frame(huge) };
        assert_eq!(
            alloc.allocate_phys_frame(PhysFrameSize::Size2MiB),
            Some(huge)
        );
    }
}
