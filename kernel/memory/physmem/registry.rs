// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the page registry, the catalogue of physical frames
//! that back virtual memory mappings.
//!
//! Every frame installed into a page table has a [`PhysicalPage`]
//! record here, keyed by its start address. The record counts how
//! many virtual locations map the frame: mapping code takes a
//! reference with [`ref_frame`](PageRegistry::ref_frame) before
//! installing and drops it with
//! [`deref_frame`](PageRegistry::deref_frame) after clearing the
//! entry. A frame whose count reaches zero is handed back to the
//! frame allocator.
//!
//! The registry also owns the shared zero frame that backs every
//! anonymous demand-zero page until its first write. That frame is
//! pinned: dereferencing never frees it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr;
use locks::{lock, SpinLock};
use memory::{
    phys_to_virt_addr_at, PhysAddr, PhysFrame, PhysFrameAllocator, PhysFrameDeallocator,
    PhysFrameSize, VirtAddr,
};

/// A source of physical memory frames: an allocator that can also
/// take frames back.
///
pub trait FrameSource: PhysFrameAllocator + PhysFrameDeallocator + Send {}

impl<T: PhysFrameAllocator + PhysFrameDeallocator + Send> FrameSource for T {}

/// The registry's record of a single physical frame.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysicalPage {
    frame: PhysFrame,
    refcount: usize,
    pinned: bool,
}

impl PhysicalPage {
    /// Returns the frame this record describes.
    ///
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Returns the number of virtual locations currently
    /// mapping the frame.
    ///
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// Returns whether the frame is pinned. A pinned frame
    /// is never returned to the allocator.
    ///
    pub fn pinned(&self) -> bool {
        self.pinned
    }
}

/// Options for [`PageRegistry::allocate`].
///
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocateOptions {
    /// Constrain the frame to the low 4 GiB of physical
    /// memory.
    pub phys32: bool,

    /// Allocate a 2 MiB frame rather than a 4 KiB frame.
    pub huge: bool,

    /// Zero the frame's contents before returning it.
    pub zero: bool,
}

impl AllocateOptions {
    /// Returns the default options: a 4 KiB frame, placed
    /// anywhere, with undefined contents.
    ///
    pub fn new() -> Self {
        AllocateOptions::default()
    }
}

/// A reference-counted catalogue of the physical frames backing
/// virtual memory.
///
pub struct PageRegistry {
    physmem_offset: VirtAddr,
    inner: SpinLock<RegistryInner>,
}

struct RegistryInner {
    pages: BTreeMap<usize, PhysicalPage>,
    source: Box<dyn FrameSource>,
    anon_frame: Option<PhysFrame>,
}

impl PageRegistry {
    /// Returns a registry with no frame source, which cannot
    /// allocate. Used for the kernel's static registry before
    /// [`install`](Self::install) brings it up.
    ///
    pub fn empty() -> Self {
        PageRegistry {
            physmem_offset: memory::constants::PHYSICAL_MEMORY_OFFSET,
            inner: SpinLock::new(RegistryInner {
                pages: BTreeMap::new(),
                source: Box::new(NoMemory),
                anon_frame: None,
            }),
        }
    }

    /// Returns a registry drawing frames from the given source,
    /// with physical memory reachable at the given offset.
    ///
    /// # Panics
    ///
    /// `new` will panic if the source cannot supply the shared
    /// anonymous zero frame.
    ///
    pub fn new(source: Box<dyn FrameSource>, physmem_offset: VirtAddr) -> Self {
        let registry = PageRegistry {
            physmem_offset,
            inner: SpinLock::new(RegistryInner {
                pages: BTreeMap::new(),
                source: Box::new(NoMemory),
                anon_frame: None,
            }),
        };

        registry.install(source);
        registry
    }

    /// Installs the registry's frame source and allocates the
    /// pinned anonymous zero frame.
    ///
    /// # Panics
    ///
    /// `install` will panic if the source cannot supply the
    /// zero frame. This only happens when the machine is out
    /// of memory at boot.
    ///
    pub fn install(&self, source: Box<dyn FrameSource>) {
        let mut inner = lock!(self.inner);
        inner.source = source;

        let frame = inner
            .source
            .allocate_phys_frame(PhysFrameSize::Size4KiB)
            .expect("out of physical memory allocating the anonymous zero frame");

        // The frame must actually be zero, or anonymous
        // memory would leak old contents.
        unsafe { zero_frame(frame, self.physmem_offset) };

        inner.pages.insert(
            frame.start_address().as_usize(),
            PhysicalPage {
                frame,
                refcount: 1,
                pinned: true,
            },
        );
        inner.anon_frame = Some(frame);
    }

    /// Returns the offset at which the registry's physical
    /// memory is mapped.
    ///
    pub fn physmem_offset(&self) -> VirtAddr {
        self.physmem_offset
    }

    /// Returns the pinned frame of zeroes that backs anonymous
    /// memory until first write.
    ///
    /// # Panics
    ///
    /// `anon_frame` will panic if the registry has not been
    /// brought up with a frame source.
    ///
    pub fn anon_frame(&self) -> PhysFrame {
        lock!(self.inner)
            .anon_frame
            .expect("page registry used before a frame source was installed")
    }

    /// Allocates a frame and enters it into the registry with a
    /// reference count of one.
    ///
    pub fn allocate(&self, options: AllocateOptions) -> Option<PhysFrame> {
        let size = if options.huge {
            PhysFrameSize::Size2MiB
        } else {
            PhysFrameSize::Size4KiB
        };

        let mut inner = lock!(self.inner);
        let frame = if options.phys32 {
            let limit = PhysAddr::new(1 << 32);
            inner.source.allocate_phys_frame_below(size, limit)?
        } else {
            inner.source.allocate_phys_frame(size)?
        };

        if options.zero {
            unsafe { zero_frame(frame, self.physmem_offset) };
        }

        inner.pages.insert(
            frame.start_address().as_usize(),
            PhysicalPage {
                frame,
                refcount: 1,
                pinned: false,
            },
        );

        Some(frame)
    }

    /// Returns the record of the frame containing the given
    /// address, if the registry tracks it.
    ///
    pub fn lookup(&self, addr: PhysAddr) -> Option<PhysicalPage> {
        let inner = lock!(self.inner);
        lookup_containing(&inner.pages, addr).copied()
    }

    /// Returns the reference count of the frame containing the
    /// given address, if the registry tracks it.
    ///
    pub fn refcount(&self, addr: PhysAddr) -> Option<usize> {
        self.lookup(addr).map(|page| page.refcount)
    }

    /// Takes a reference to the frame containing the given
    /// address.
    ///
    /// # Panics
    ///
    /// `ref_frame` will panic if the registry does not track
    /// the frame: a mapping is being made to memory the memory
    /// manager does not own.
    ///
    pub fn ref_frame(&self, addr: PhysAddr) {
        let mut inner = lock!(self.inner);
        match lookup_containing_mut(&mut inner.pages, addr) {
            Some(page) => page.refcount += 1,
            None => panic!("cannot reference untracked frame at {:p}", addr),
        }
    }

    /// Drops a reference to the frame containing the given
    /// address, returning the frame to the allocator if this
    /// was the last reference and the frame is not pinned.
    ///
    /// Returns whether the frame was freed.
    ///
    /// # Panics
    ///
    /// `deref_frame` will panic if the registry does not track
    /// the frame.
    ///
    pub fn deref_frame(&self, addr: PhysAddr) -> bool {
        let mut inner = lock!(self.inner);
        let page = match lookup_containing_mut(&mut inner.pages, addr) {
            Some(page) => page,
            None => panic!("cannot dereference untracked frame at {:p}", addr),
        };

        if page.pinned {
            // Pinned frames keep their final reference.
            if page.refcount > 1 {
                page.refcount -= 1;
            }

            return false;
        }

        page.refcount -= 1;
        if page.refcount > 0 {
            return false;
        }

        let frame = page.frame;
        inner.pages.remove(&frame.start_address().as_usize());
        unsafe { inner.source.deallocate_phys_frame(frame) };

        true
    }

    /// Prints debug information about the registry's state.
    ///
    pub fn debug(&self) {
        let inner = lock!(self.inner);
        serial::println!("Page registry: {} frames tracked.", inner.pages.len());
    }
}

// The allocator half of the registry can be used directly as a
// raw frame allocator, for consumers like page-table construction
// whose frames are not registry records.

unsafe impl PhysFrameAllocator for &PageRegistry {
    fn allocate_phys_frame(&mut self, size: PhysFrameSize) -> Option<PhysFrame> {
        let mut inner = lock!(self.inner);
        inner.source.allocate_phys_frame(size)
    }

    fn allocate_phys_frame_below(
        &mut self,
        size: PhysFrameSize,
        limit: PhysAddr,
    ) -> Option<PhysFrame> {
        let mut inner = lock!(self.inner);
        inner.source.allocate_phys_frame_below(size, limit)
    }
}

impl PhysFrameDeallocator for &PageRegistry {
    unsafe fn deallocate_phys_frame(&mut self, frame: PhysFrame) {
        let mut inner = lock!(self.inner);
        inner.source.deallocate_phys_frame(frame);
    }
}

/// Finds the record of the frame containing `addr`.
///
fn lookup_containing(
    pages: &BTreeMap<usize, PhysicalPage>,
    addr: PhysAddr,
) -> Option<&PhysicalPage> {
    let (_, page) = pages.range(..=addr.as_usize()).next_back()?;
    if page.frame.contains(addr) {
        Some(page)
    } else {
        None
    }
}

/// Finds the record of the frame containing `addr`.
///
fn lookup_containing_mut(
    pages: &mut BTreeMap<usize, PhysicalPage>,
    addr: PhysAddr,
) -> Option<&mut PhysicalPage> {
    let (_, page) = pages.range_mut(..=addr.as_usize()).next_back()?;
    if page.frame.contains(addr) {
        Some(page)
    } else {
        None
    }
}

/// Fills the given frame with zeroes through the physical
/// memory mapping.
///
unsafe fn zero_frame(frame: PhysFrame, physmem_offset: VirtAddr) {
    let virt = phys_to_virt_addr_at(frame.start_address(), physmem_offset);
    ptr::write_bytes(virt.as_usize() as *mut u8, 0, frame.size().bytes());
}

/// A frame source with nothing to give. This is what an empty
/// registry holds before boot installs the real allocator.
///
struct NoMemory;

unsafe impl PhysFrameAllocator for NoMemory {
    fn allocate_phys_frame(&mut self, _size: PhysFrameSize) -> Option<PhysFrame> {
        None
    }

    fn allocate_phys_frame_below(
        &mut self,
        _size: PhysFrameSize,
        _limit: PhysAddr,
    ) -> Option<PhysFrame> {
        None
    }
}

impl PhysFrameDeallocator for NoMemory {
    unsafe fn deallocate_phys_frame(&mut self, frame: PhysFrame) {
        panic!("cannot deallocate frame {:?}: no frame source", frame);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use emumem::EmulatedMemory;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn test_allocate_and_release() {
        let mem = EmulatedMemory::new(64);
        let registry = mem.registry();

        // A fresh frame has one reference.
        let frame = registry.allocate(AllocateOptions::new()).unwrap();
        let addr = frame.start_address();
        assert_eq!(registry.refcount(addr), Some(1));

        // Lookup works for any address within the frame.
        let inside = addr + 123;
        assert_eq!(registry.lookup(inside).unwrap().frame(), frame);

        // N references need N dereferences to free.
        registry.ref_frame(addr);
        registry.ref_frame(addr);
        assert_eq!(registry.refcount(addr), Some(3));
        assert!(!registry.deref_frame(addr));
        assert!(!registry.deref_frame(addr));
        assert_eq!(registry.refcount(addr), Some(1));
        assert!(registry.deref_frame(addr));

        // The frame is gone from the registry.
        assert_eq!(registry.lookup(addr), None);
    }

    #[test]
    fn test_zeroed_allocation() {
        let mem = EmulatedMemory::new(64);
        let registry = mem.registry();

        // Dirty a frame, free it, then check a zeroed
        // allocation really is zero.
        let frame = registry.allocate(AllocateOptions::new()).unwrap();
        mem.write_byte(frame.start_address() + 17, 0x5a);
        registry.deref_frame(frame.start_address());

        let mut options = AllocateOptions::new();
        options.zero = true;
        let frame = registry.allocate(options).unwrap();
        for i in 0..frame.size().bytes() {
            assert_eq!(mem.read_byte(frame.start_address() + i), 0);
        }
    }

    #[test]
    fn test_anon_frame_pinned() {
        let mem = EmulatedMemory::new(64);
        let registry = mem.registry();

        let anon = registry.anon_frame();
        let addr = anon.start_address();
        assert!(registry.lookup(addr).unwrap().pinned());
        assert_eq!(registry.refcount(addr), Some(1));

        // Dereferencing a pinned frame never frees it.
        assert!(!registry.deref_frame(addr));
        assert!(!registry.deref_frame(addr));
        assert_eq!(registry.refcount(addr), Some(1));

        // The zero frame is all zeroes.
        for i in 0..anon.size().bytes() {
            assert_eq!(mem.read_byte(addr + i), 0);
        }
    }

    #[test]
    fn test_phys32_allocation() {
        let mem = EmulatedMemory::new(64);
        let registry = mem.registry();

        // The arena's synthetic addresses are low, so a
        // 32-bit constrained allocation succeeds and lands
        // below 4 GiB.
        let mut options = AllocateOptions::new();
        options.phys32 = true;
        let frame = registry.allocate(options).unwrap();
        assert!(frame.end_address().as_usize() < 1 << 32);
    }

    #[test]
    fn test_concurrent_ref_deref() {
        let mem = EmulatedMemory::new(64);
        let registry = Arc::new(mem.registry());

        let frame = registry.allocate(AllocateOptions::new()).unwrap();
        let addr = frame.start_address();

        // Balanced ref/deref pairs from many threads leave
        // the count where it started.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..5_000 {
                    registry.ref_frame(addr);
                    registry.deref_frame(addr);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.refcount(addr), Some(1));
        assert!(registry.deref_frame(addr));
    }
}
