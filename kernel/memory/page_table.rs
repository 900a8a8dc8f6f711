// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::constants::PHYSICAL_MEMORY_OFFSET;
use crate::{
    InvalidPhysAddr, PageProtection, PhysAddr, PhysFrame, PhysFrameAllocator, PhysFrameSize,
    VirtAddr, VirtPage, VirtPageSize,
};
use bitflags::bitflags;
use x86_64::instructions::tlb;

// The 51st bit of a physical frame address in
// a page table entry is reserved and must be
// unset. This mask unsets all bits outside the
// valid physical address space, plus bits 51
// and bits 11 and below, which are always 0
// anyway, due to frame alignment.
//
const ADDR_MASK: u64 = 0x0007_ffff_ffff_f000;

/// Represents a single entry in a page table.
///
#[derive(Clone)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    /// Returns a new, empty page table entry.
    ///
    #[inline]
    pub const fn new() -> Self {
        PageTableEntry { entry: 0 }
    }

    /// Clears this entry.
    ///
    #[inline]
    pub fn zero(&mut self) {
        self.entry = 0;
    }

    /// Returns whether the entry has no bits set at all.
    ///
    /// Note that this is stronger than the `PRESENT` flag
    /// being unset: a non-present entry may still record
    /// a frame address and flags.
    ///
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.entry == 0
    }

    /// Returns whether the entry is marked as present.
    ///
    #[inline]
    pub const fn is_present(&self) -> bool {
        PageTableFlags::from_bits_truncate(self.entry).present()
    }

    /// Returns the flags for this entry.
    ///
    #[inline]
    pub const fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.entry)
    }

    /// Returns the physical address in this entry.
    /// Note that this address will always have the
    /// least significant 12 bits unset.
    ///
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.entry as usize & PhysFrameSize::Size4KiB.start_mask())
    }

    /// Returns the child page table referenced by this
    /// entry.
    ///
    /// # Safety
    ///
    /// This dereferences the address in this entry,
    /// which is unsafe.
    ///
    #[inline]
    unsafe fn page_table_at(&self, physmem_offset: VirtAddr) -> PageTable {
        let addr = self.addr();
        PageTable::at_offset(addr, physmem_offset)
    }

    /// Returns the physical frame referenced by this
    /// entry.
    ///
    #[inline]
    pub fn phys_frame(&self, frame_size: PhysFrameSize) -> Result<PhysFrame, InvalidPhysAddr> {
        let addr = self.addr();
        PhysFrame::from_start_address(addr, frame_size)
    }

    /// Sets the entry's flags.
    ///
    #[inline]
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.entry = flags.bits() | self.addr().as_usize() as u64;
    }

    /// Sets the entry's physical address to `frame` and
    /// the flags to `flags`. If the top bit of the frame's
    /// start address is set, `set_frame_flags` returns it
    /// as an `InvalidPhysAddr`.
    ///
    #[inline]
    pub fn set_frame_flags(
        &mut self,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), InvalidPhysAddr> {
        let start_addr = frame.start_address().as_usize() as u64;
        if start_addr & ADDR_MASK != start_addr {
            Err(InvalidPhysAddr(start_addr as usize))
        } else {
            self.entry = flags.bits() | start_addr;
            Ok(())
        }
    }

    /// Creates a new page table for this entry if one
    /// does not already exist.
    ///
    /// The flags for this entry will have the bits in
    /// `flags` set. If any other flag bits in this entry
    /// are set, but are not set in `flags`, those bits
    /// will not be unset.
    ///
    fn ensure_page_table_at<A>(
        &mut self,
        flags: PageTableFlags,
        allocator: &mut A,
        offset: VirtAddr,
    ) -> Result<PageTable, PageMappingError>
    where
        A: PhysFrameAllocator + ?Sized,
    {
        // If there's already a page table present, we
        // just update the flags and return it.
        if self.is_present() || self.addr() != PhysAddr::zero() {
            let current = self.flags();
            if !flags.is_empty() && !current.contains(flags) {
                self.set_flags(flags | current);
            }

            return Ok(unsafe { self.page_table_at(offset) });
        }

        // Allocate a physical frame.
        if let Some(frame) = allocator.allocate_phys_frame(PhysFrameSize::Size4KiB) {
            // If we get a frame we can't use, we return an
            // error. This can only occur if we have used
            // roughly 2048 TiB of physical memory.
            self.set_frame_flags(frame, flags)
                .map_err(|InvalidPhysAddr(addr)| PageMappingError::InvalidPhysAddr(addr))?;
        } else {
            return Err(PageMappingError::PageTableAllocationFailed);
        }

        let mut page_table = unsafe { self.page_table_at(offset) };
        page_table.zero();

        Ok(page_table)
    }
}

bitflags! {
    /// The flags in a page table entry.
    ///
    pub struct PageTableFlags: u64 {
        /// Indicates that the referenced page table or
        /// physical frame is mapped and usable.
        const PRESENT = 1 << 0;

        /// Indicates that the referenced page tables
        /// or physical frame is writable. If this bit
        /// is unset when referencing a page table,
        /// none of the memory referenced by that page
        /// table (and any child tables) is writable,
        /// irrespective of those page tables' flags.
        const WRITABLE = 1 << 1;

        /// Indicates that accesses from ring 3 are
        /// allowed. If unset, only rings 2 and below
        /// can access the memory.
        const USER_ACCESSIBLE = 1 << 2;

        /// Indicates that the caching behaviour for
        /// this memory is write-through. Otherwise,
        /// it is write-back.
        const WRITE_THROUGH = 1 << 3;

        /// Indicates that the memory should not be
        /// cached.
        const NO_CACHE = 1 << 4;

        /// Indicates that the referenced page table or
        /// physical frame has been read since this bit
        /// was last unset.
        const ACCESSED = 1 << 5;

        /// Indicates that the referenced page table or
        /// physical frame has been written since this
        /// bit was last unset.
        const DIRTY = 1 << 6;

        /// Indicates that this references a huge
        /// physical frame, rather than a page table.
        const HUGE_PAGE = 1 << 7;

        /// Indicates that this mapping is not flushed
        /// from the TLB when an address space change
        /// takes place.
        const GLOBAL = 1 << 8;

        /// OS-defined: the recorded frame address is a
        /// slot in swap space, not physical memory.
        /// Hardware ignores this bit.
        const SWAP = 1 << 9;

        /// Indicates that the referenced memory cannot
        /// be used for instruction fetches and is not
        /// executable.
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableFlags {
    /// Returns whether the `PRESENT` flag is set.
    ///
    pub const fn present(&self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Returns whether the `PRESENT` flag is unset.
    ///
    pub const fn absent(&self) -> bool {
        !self.contains(Self::PRESENT)
    }

    /// Returns whether the `WRITABLE` flag is set.
    ///
    pub const fn writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Returns whether the `WRITABLE` flag is unset.
    ///
    pub const fn read_only(&self) -> bool {
        !self.contains(Self::WRITABLE)
    }

    /// Returns whether the `HUGE_PAGE` flag is set.
    ///
    pub const fn huge(&self) -> bool {
        self.contains(Self::HUGE_PAGE)
    }

    /// Returns whether the `HUGE_PAGE` flag is unset.
    ///
    pub const fn small(&self) -> bool {
        !self.contains(Self::HUGE_PAGE)
    }

    /// Returns whether the `GLOBAL` flag is set.
    ///
    pub const fn global(&self) -> bool {
        self.contains(Self::GLOBAL)
    }

    /// Returns whether the `NO_EXECUTE` flag is set.
    ///
    pub const fn no_execute(&self) -> bool {
        self.contains(Self::NO_EXECUTE)
    }

    /// Returns whether the `NO_EXECUTE` flag is unset.
    ///
    pub const fn executable(&self) -> bool {
        !self.contains(Self::NO_EXECUTE)
    }
}

/// The number of entries in a page table.
///
const NUM_ENTRIES: usize = 512;

/// The mask for indices into a page table.
///
const ENTRY_MASK: usize = NUM_ENTRIES - 1;

/// Provides access to a page table and its contents.
///
/// The table's memory is reached through the virtual address at
/// which physical memory is mapped. [`PageTable::at`] uses the
/// kernel's own mapping of all physical memory;
/// [`PageTable::at_offset`] accepts any other offset, which allows
/// page tables held in ordinary heap memory to be built and walked,
/// such as in tests.
///
pub struct PageTable<'entries> {
    // Virtual address at which the table's physical
    // memory is mapped.
    physmem_offset: VirtAddr,

    // A reference/pointer to the actual page table.
    table: &'entries mut [PageTableEntry; NUM_ENTRIES],
}

impl<'entries> PageTable<'entries> {
    /// Creates a page table referring to the page table data
    /// at the given address.
    ///
    /// If `addr` is not frame-aligned, then `at` will return
    /// [`InvalidPhysAddr`].
    ///
    /// # Safety
    ///
    /// This dereferences `addr`, which is unsafe.
    ///
    pub unsafe fn at(addr: PhysAddr) -> Result<Self, InvalidPhysAddr> {
        if !addr.is_aligned(PhysFrameSize::Size4KiB.bytes()) {
            Err(InvalidPhysAddr(addr.as_usize()))
        } else {
            let physmem_offset = PHYSICAL_MEMORY_OFFSET;
            Ok(Self::at_offset(addr, physmem_offset))
        }
    }

    /// Creates a page table from the page table data at the
    /// given address, using the provided virtual memory
    /// offset at which physical memory is mapped.
    ///
    /// # Note
    ///
    /// A table viewed through an offset other than
    /// [`PHYSICAL_MEMORY_OFFSET`] cannot be the CPU's active
    /// table, such as when emulating physical memory in
    /// userspace by providing an offset of `0`.
    ///
    /// # Safety
    ///
    /// This dereferences `addr`, which is unsafe.
    ///
    pub unsafe fn at_offset(addr: PhysAddr, physmem_offset: VirtAddr) -> Self {
        let table_addr = physmem_offset
            .checked_add(addr.as_usize())
            .expect("invalid physical address");
        let table_ptr = table_addr.as_usize() as *mut [PageTableEntry; NUM_ENTRIES];
        let table = &mut *table_ptr;

        PageTable {
            physmem_offset,
            table,
        }
    }

    /// Returns the offset at which this table's physical
    /// memory is mapped.
    ///
    pub fn physmem_offset(&self) -> VirtAddr {
        self.physmem_offset
    }

    /// Clears the page table, setting every entry to zero.
    ///
    /// Note that this does nothing to any child page tables
    /// or physical frames currently referenced by this page
    /// table.
    ///
    pub fn zero(&mut self) {
        for entry in self.table.iter_mut() {
            entry.zero();
        }
    }

    /// Iterate through the entries in this page table.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.table.iter()
    }

    /// Translate the given virtual address to a physical
    /// address, according to the page tables.
    ///
    pub fn translate(&self, addr: VirtAddr) -> PageMapping {
        let level4_entry = &self.table[level4_index(addr)];
        let level4_flags = level4_entry.flags();
        if level4_flags.absent() {
            return PageMapping::NotMapped;
        } else if level4_flags.huge() {
            // Strictly speaking, this is an invalid entry,
            // but this error is near enough.
            return PageMapping::InvalidLevel4PageTable;
        }

        let level3_table = unsafe { level4_entry.page_table_at(self.physmem_offset) };
        let level3_entry = &level3_table.table[level3_index(addr)];
        let level3_flags = level3_entry.flags();
        if level3_flags.absent() {
            return PageMapping::NotMapped;
        } else if level3_flags.huge() {
            let size = PhysFrameSize::Size1GiB;
            let frame = match level3_entry.phys_frame(size) {
                Ok(frame) => frame,
                Err(addr) => return PageMapping::InvalidPageTableAddr(addr.0),
            };

            let offset = addr.as_usize() & (size.bytes() - 1);
            let addr = frame.start_address() + offset;
            let flags = level3_flags;
            return PageMapping::Mapping { frame, addr, flags };
        }

        let level2_table = unsafe { level3_entry.page_table_at(self.physmem_offset) };
        let level2_entry = &level2_table.table[level2_index(addr)];
        let level2_flags = level2_entry.flags();
        if level2_flags.absent() {
            return PageMapping::NotMapped;
        } else if level2_flags.huge() {
            let size = PhysFrameSize::Size2MiB;
            let frame = match level2_entry.phys_frame(size) {
                Ok(frame) => frame,
                Err(addr) => return PageMapping::InvalidPageTableAddr(addr.0),
            };

            let offset = addr.as_usize() & (size.bytes() - 1);
            let addr = frame.start_address() + offset;
            let flags = level2_flags;
            return PageMapping::Mapping { frame, addr, flags };
        }

        let level1_table = unsafe { level2_entry.page_table_at(self.physmem_offset) };
        let level1_entry = &level1_table.table[level1_index(addr)];
        let level1_flags = level1_entry.flags();
        if level1_flags.absent() {
            return PageMapping::NotMapped;
        }

        let size = PhysFrameSize::Size4KiB;
        let frame = match level1_entry.phys_frame(size) {
            Ok(frame) => frame,
            Err(addr) => return PageMapping::InvalidPageTableAddr(addr.0),
        };

        let offset = addr.as_usize() & (size.bytes() - 1);
        let addr = frame.start_address() + offset;
        let flags = level1_flags;
        PageMapping::Mapping { frame, addr, flags }
    }

    /// Translate the given virtual address to a physical
    /// address, according to the page tables.
    ///
    pub fn translate_addr(&self, addr: VirtAddr) -> Option<PhysAddr> {
        if let PageMapping::Mapping { addr, .. } = self.translate(addr) {
            Some(addr)
        } else {
            None
        }
    }

    /// Translate the given virtual page to a physical
    /// frame, according to the page tables.
    ///
    pub fn translate_page(&self, page: VirtPage) -> Option<PhysFrame> {
        if let PageMapping::Mapping { frame, .. } = self.translate(page.start_address()) {
            Some(frame)
        } else {
            None
        }
    }

    /// Report the leaf entry covering the given virtual
    /// address, even if the entry is not present.
    ///
    /// Unlike [`translate`](Self::translate), `query` sees
    /// entries whose `PRESENT` flag is unset but which still
    /// record a frame address and flags. The memory manager
    /// parks the frame backing a demand-paged mapping in such
    /// entries before the first access. `query` returns `None`
    /// only when an intermediate table is missing or the leaf
    /// entry is completely empty.
    ///
    pub fn query(&self, addr: VirtAddr) -> Option<PageInfo> {
        let level4_entry = &self.table[level4_index(addr)];
        if level4_entry.flags().absent() {
            return None;
        }

        let level3_table = unsafe { level4_entry.page_table_at(self.physmem_offset) };
        let level3_entry = &level3_table.table[level3_index(addr)];
        let level3_flags = level3_entry.flags();
        if level3_flags.huge() {
            // A parked or live 1 GiB frame.
            let frame =
                PhysFrame::containing_address(level3_entry.addr(), PhysFrameSize::Size1GiB);
            return Some(PageInfo {
                frame,
                flags: level3_flags,
            });
        } else if level3_flags.absent() {
            return None;
        }

        let level2_table = unsafe { level3_entry.page_table_at(self.physmem_offset) };
        let level2_entry = &level2_table.table[level2_index(addr)];
        let level2_flags = level2_entry.flags();
        if level2_flags.huge() {
            // A parked or live 2 MiB frame.
            let frame =
                PhysFrame::containing_address(level2_entry.addr(), PhysFrameSize::Size2MiB);
            return Some(PageInfo {
                frame,
                flags: level2_flags,
            });
        } else if level2_flags.absent() {
            return None;
        }

        let level1_table = unsafe { level2_entry.page_table_at(self.physmem_offset) };
        let level1_entry = &level1_table.table[level1_index(addr)];
        if level1_entry.is_empty() {
            return None;
        }

        let frame = PhysFrame::containing_address(level1_entry.addr(), PhysFrameSize::Size4KiB);
        Some(PageInfo {
            frame,
            flags: level1_entry.flags(),
        })
    }

    /// Create a new mapping in the page table.
    ///
    /// The `allocator` may be called to allocate physical
    /// memory for any new page tables that are created.
    ///
    /// If the virtual page is already mapped, `map` fails
    /// with [`PageMappingError::PageAlreadyMapped`]; use
    /// [`set_page`](Self::set_page) to replace an existing
    /// mapping.
    ///
    /// # Panics
    ///
    /// If the virtual page and the physical frame are not
    /// of identical size, `map` will panic.
    ///
    /// # Safety
    ///
    /// Making a page mapping is unsafe, as the caller must
    /// ensure that any other mappings to `frame` are not
    /// used concurrently with changes to `page`. This is
    /// one of the kernel's biggest responsibilities.
    ///
    pub unsafe fn map<A>(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<PageMappingChange, PageMappingError>
    where
        A: PhysFrameAllocator + ?Sized,
    {
        assert_eq!(page.size(), frame.size());

        let size = page.size();
        let addr = page.start_address();
        let offset = self.physmem_offset;
        let parent_table_flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        let level4_entry = &mut self.table[level4_index(addr)];
        if level4_entry.flags().huge() {
            // Strictly speaking, this is an invalid entry,
            // but this error is near enough.
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let level3_table =
            level4_entry.ensure_page_table_at(parent_table_flags, allocator, offset)?;
        let level3_entry = &mut level3_table.table[level3_index(addr)];
        if size == VirtPageSize::Size1GiB {
            if level3_entry.is_present() || level3_entry.addr() != PhysAddr::zero() {
                return Err(PageMappingError::PageAlreadyMapped(
                    PhysFrame::containing_address(level3_entry.addr(), frame.size()),
                ));
            }

            write_leaf(level3_entry, size, frame, flags)?;
            return Ok(PageMappingChange::new(page, offset));
        }

        if level3_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let level2_table =
            level3_entry.ensure_page_table_at(parent_table_flags, allocator, offset)?;
        let level2_entry = &mut level2_table.table[level2_index(addr)];
        if size == VirtPageSize::Size2MiB {
            if level2_entry.is_present() || level2_entry.addr() != PhysAddr::zero() {
                return Err(PageMappingError::PageAlreadyMapped(
                    PhysFrame::containing_address(level2_entry.addr(), frame.size()),
                ));
            }

            write_leaf(level2_entry, size, frame, flags)?;
            return Ok(PageMappingChange::new(page, offset));
        }

        if level2_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let level1_table =
            level2_entry.ensure_page_table_at(parent_table_flags, allocator, offset)?;
        let level1_entry = &mut level1_table.table[level1_index(addr)];
        if level1_entry.is_present() || level1_entry.addr() != PhysAddr::zero() {
            return Err(PageMappingError::PageAlreadyMapped(
                PhysFrame::containing_address(level1_entry.addr(), frame.size()),
            ));
        }

        write_leaf(level1_entry, size, frame, flags)?;
        Ok(PageMappingChange::new(page, offset))
    }

    /// Install a mapping in the page table, replacing any
    /// existing mapping for the page.
    ///
    /// Unlike [`map`](Self::map), `set_page` does not care
    /// what the leaf entry currently holds; the previous
    /// frame, if any, is returned so that the caller can
    /// release its reference.
    ///
    /// Note that a mapping installed without
    /// [`PRESENT`](PageTableFlags::PRESENT) parks the frame
    /// in the entry without making it reachable; this is
    /// visible to [`query`](Self::query) but not to
    /// [`translate`](Self::translate).
    ///
    /// # Panics
    ///
    /// If the virtual page and the physical frame are not
    /// of identical size, `set_page` will panic.
    ///
    /// # Safety
    ///
    /// As for [`map`](Self::map).
    ///
    pub unsafe fn set_page<A>(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        flags: PageTableFlags,
        allocator: &mut A,
    ) -> Result<(Option<PhysFrame>, PageMappingChange), PageMappingError>
    where
        A: PhysFrameAllocator + ?Sized,
    {
        assert_eq!(page.size(), frame.size());

        let size = page.size();
        let addr = page.start_address();
        let offset = self.physmem_offset;
        let parent_table_flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        let level4_entry = &mut self.table[level4_index(addr)];
        if level4_entry.flags().huge() {
            // Strictly speaking, this is an invalid entry,
            // but this error is near enough.
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let level3_table =
            level4_entry.ensure_page_table_at(parent_table_flags, allocator, offset)?;
        let level3_entry = &mut level3_table.table[level3_index(addr)];
        if size == VirtPageSize::Size1GiB {
            let previous = previous_frame(level3_entry, size.phys_frame_size());
            write_leaf(level3_entry, size, frame, flags)?;
            return Ok((previous, PageMappingChange::new(page, offset)));
        }

        if level3_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let level2_table =
            level3_entry.ensure_page_table_at(parent_table_flags, allocator, offset)?;
        let level2_entry = &mut level2_table.table[level2_index(addr)];
        if size == VirtPageSize::Size2MiB {
            let previous = previous_frame(level2_entry, size.phys_frame_size());
            write_leaf(level2_entry, size, frame, flags)?;
            return Ok((previous, PageMappingChange::new(page, offset)));
        }

        if level2_entry.flags().huge() {
            return Err(PageMappingError::LargerParentMappingExists);
        }

        let level1_table =
            level2_entry.ensure_page_table_at(parent_table_flags, allocator, offset)?;
        let level1_entry = &mut level1_table.table[level1_index(addr)];
        let previous = previous_frame(level1_entry, size.phys_frame_size());
        write_leaf(level1_entry, size, frame, flags)?;

        Ok((previous, PageMappingChange::new(page, offset)))
    }

    /// Change the page table flags for an existing mapping
    /// in the page table.
    ///
    /// # Safety
    ///
    /// Changing a page mapping is unsafe, as it may invalidate
    /// assumptions made by the compiler about whether data
    /// can be modified.
    ///
    pub unsafe fn change_flags(
        &mut self,
        page: VirtPage,
        flags: PageTableFlags,
    ) -> Result<PageMappingChange, PageRemappingError> {
        let size = page.size();
        let addr = page.start_address();
        let offset = self.physmem_offset;

        let level4_entry = &mut self.table[level4_index(addr)];
        let level4_flags = level4_entry.flags();
        if level4_flags.absent() {
            return Err(PageRemappingError::PageNotMapped);
        } else if level4_flags.huge() {
            // Strictly speaking, this is an invalid entry,
            // but this error is near enough.
            return Err(PageRemappingError::LargerParentMappingExists);
        }

        let level3_table = level4_entry.page_table_at(offset);
        let level3_entry = &mut level3_table.table[level3_index(addr)];
        let level3_flags = level3_entry.flags();
        if size == VirtPageSize::Size1GiB {
            if level3_entry.is_empty() || level3_flags.small() {
                return Err(PageRemappingError::PageNotMapped);
            }

            level3_entry.set_flags(flags | PageTableFlags::HUGE_PAGE);

            return Ok(PageMappingChange::new(page, offset));
        }

        if level3_flags.huge() {
            return Err(PageRemappingError::LargerParentMappingExists);
        } else if level3_flags.absent() {
            return Err(PageRemappingError::PageNotMapped);
        }

        let level2_table = level3_entry.page_table_at(offset);
        let level2_entry = &mut level2_table.table[level2_index(addr)];
        let level2_flags = level2_entry.flags();
        if size == VirtPageSize::Size2MiB {
            if level2_entry.is_empty() || level2_flags.small() {
                return Err(PageRemappingError::PageNotMapped);
            }

            level2_entry.set_flags(flags | PageTableFlags::HUGE_PAGE);

            return Ok(PageMappingChange::new(page, offset));
        }

        if level2_flags.huge() {
            return Err(PageRemappingError::LargerParentMappingExists);
        } else if level2_flags.absent() {
            return Err(PageRemappingError::PageNotMapped);
        }

        let level1_table = level2_entry.page_table_at(offset);
        let level1_entry = &mut level1_table.table[level1_index(addr)];
        if level1_entry.is_empty() || level1_entry.flags().huge() {
            return Err(PageRemappingError::PageNotMapped);
        }

        level1_entry.set_flags(flags & !PageTableFlags::HUGE_PAGE);

        Ok(PageMappingChange::new(page, offset))
    }

    /// Remove a mapping from the page table.
    ///
    /// The previous physical frame is returned. Note that
    /// no page tables are allocated or deallocated.
    ///
    /// # Safety
    ///
    /// Removing a page mapping is unsafe, as the caller must
    /// ensure that the virtual address range being unmapped
    /// is no longer in use.
    ///
    pub unsafe fn unmap(
        &mut self,
        page: VirtPage,
    ) -> Result<(PhysFrame, PageMappingChange), PageUnmappingError> {
        match self.clear_page(page) {
            Ok((Some(frame), change)) => Ok((frame, change)),
            Ok((None, _)) => Err(PageUnmappingError::PageNotMapped),
            Err(err) => Err(err),
        }
    }

    /// Clear the leaf entry for the given page, returning
    /// the frame it recorded, if any.
    ///
    /// Unlike [`unmap`](Self::unmap), `clear_page` tolerates
    /// entries that are already empty and entries that record
    /// a frame without being present.
    ///
    /// # Safety
    ///
    /// As for [`unmap`](Self::unmap).
    ///
    pub unsafe fn clear_page(
        &mut self,
        page: VirtPage,
    ) -> Result<(Option<PhysFrame>, PageMappingChange), PageUnmappingError> {
        let size = page.size();
        let addr = page.start_address();
        let offset = self.physmem_offset;

        let level4_entry = &mut self.table[level4_index(addr)];
        let level4_flags = level4_entry.flags();
        if level4_flags.absent() {
            return Ok((None, PageMappingChange::new(page, offset)));
        } else if level4_flags.huge() {
            // Strictly speaking, this is an invalid entry,
            // but this error is near enough.
            return Err(PageUnmappingError::LargerParentMappingExists);
        }

        let level3_table = level4_entry.page_table_at(offset);
        let level3_entry = &mut level3_table.table[level3_index(addr)];
        let level3_flags = level3_entry.flags();
        if size == VirtPageSize::Size1GiB {
            if level3_entry.is_empty() || level3_flags.small() {
                return Ok((None, PageMappingChange::new(page, offset)));
            }

            let frame = PhysFrame::containing_address(level3_entry.addr(), PhysFrameSize::Size1GiB);
            level3_entry.zero();
            return Ok((Some(frame), PageMappingChange::new(page, offset)));
        }

        if level3_flags.huge() {
            return Err(PageUnmappingError::LargerParentMappingExists);
        } else if level3_flags.absent() {
            return Ok((None, PageMappingChange::new(page, offset)));
        }

        let level2_table = level3_entry.page_table_at(offset);
        let level2_entry = &mut level2_table.table[level2_index(addr)];
        let level2_flags = level2_entry.flags();
        if size == VirtPageSize::Size2MiB {
            if level2_entry.is_empty() || level2_flags.small() {
                return Ok((None, PageMappingChange::new(page, offset)));
            }

            let frame = PhysFrame::containing_address(level2_entry.addr(), PhysFrameSize::Size2MiB);
            level2_entry.zero();
            return Ok((Some(frame), PageMappingChange::new(page, offset)));
        }

        if level2_flags.huge() {
            return Err(PageUnmappingError::LargerParentMappingExists);
        } else if level2_flags.absent() {
            return Ok((None, PageMappingChange::new(page, offset)));
        }

        let level1_table = level2_entry.page_table_at(offset);
        let level1_entry = &mut level1_table.table[level1_index(addr)];
        if level1_entry.is_empty() || level1_entry.flags().huge() {
            return Ok((None, PageMappingChange::new(page, offset)));
        }

        let frame = PhysFrame::containing_address(level1_entry.addr(), PhysFrameSize::Size4KiB);
        level1_entry.zero();

        Ok((Some(frame), PageMappingChange::new(page, offset)))
    }

}

/// Writes a leaf entry, setting or clearing the huge
/// page flag according to the page size.
///
fn write_leaf(
    entry: &mut PageTableEntry,
    size: VirtPageSize,
    frame: PhysFrame,
    flags: PageTableFlags,
) -> Result<(), PageMappingError> {
    let flags = if size == VirtPageSize::Size4KiB {
        flags & !PageTableFlags::HUGE_PAGE
    } else {
        flags | PageTableFlags::HUGE_PAGE
    };

    entry
        .set_frame_flags(frame, flags)
        .map_err(|InvalidPhysAddr(addr)| PageMappingError::InvalidPhysAddr(addr))
}

/// Returns the frame currently recorded in a leaf entry,
/// if any.
///
fn previous_frame(entry: &PageTableEntry, size: PhysFrameSize) -> Option<PhysFrame> {
    if entry.is_empty() {
        None
    } else {
        Some(PhysFrame::containing_address(entry.addr(), size))
    }
}

/// The leaf page table entry covering a virtual address, as
/// reported by [`PageTable::query`].
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageInfo {
    /// The frame recorded in the entry. If the entry's
    /// [`SWAP`](PageTableFlags::SWAP) flag is set, the
    /// "frame" is actually a slot in swap space.
    pub frame: PhysFrame,

    /// The entry's flags.
    pub flags: PageTableFlags,
}

impl PageInfo {
    /// Returns the portable protection record expressed
    /// by the entry's flags.
    ///
    pub fn protection(&self) -> PageProtection {
        PageProtection::from_table_flags(self.flags)
    }
}

/// Describes the result of translating a virtual address
/// to a physical address using a set of page tables.
///
#[derive(Debug, PartialEq)]
pub enum PageMapping {
    /// A valid mapping.
    Mapping {
        /// The frame in which the physical translated address
        /// resides.
        frame: PhysFrame,
        /// The translated physical address.
        addr: PhysAddr,
        /// The page table flags for the translated physical
        /// frame.
        flags: PageTableFlags,
    },
    /// An invalid mapping, due to the [`PRESENT`](PageTableFlags::PRESENT)
    /// flag being unset.
    NotMapped,
    /// An invalid mapping, due to an incorrect page table
    /// physical address.
    InvalidPageTableAddr(usize),
    /// An invalid mapping, due to the level-4 page table
    /// having the [`HUGE_PAGE`](PageTableFlags::HUGE_PAGE)
    /// bit set.
    InvalidLevel4PageTable,
}

/// Describes a page mapping that has been changed. This
/// must either be flushed to update the [TLB](https://en.wikipedia.org/wiki/Translation_lookaside_buffer),
/// or ignored. If the change is ignored, the CPU may not
/// recognise the page mapping.
///
#[derive(Debug)]
#[must_use = "Page mapping changes must either flush the TLB or be ignored explicitly."]
pub struct PageMappingChange {
    page: VirtPage,
    physmem_offset: VirtAddr,
}

impl PageMappingChange {
    fn new(page: VirtPage, physmem_offset: VirtAddr) -> Self {
        PageMappingChange {
            page,
            physmem_offset,
        }
    }

    /// Flush the relevant portion of the TLB for this
    /// page mapping.
    ///
    /// A page table reached through an offset other than
    /// [`PHYSICAL_MEMORY_OFFSET`] cannot be the CPU's
    /// active table, so there is nothing to invalidate
    /// and `flush` does nothing.
    ///
    #[inline]
    pub fn flush(self) {
        if self.physmem_offset == PHYSICAL_MEMORY_OFFSET {
            tlb::flush(self.page.start_address().as_x86_64());
        }
    }

    /// Flush the TLB if `invalidate` is set, otherwise
    /// ignore the change.
    ///
    #[inline]
    pub fn flush_if(self, invalidate: bool) {
        if invalidate {
            self.flush();
        } else {
            self.ignore();
        }
    }

    /// Ignore the page mapping change.
    ///
    /// This may result in unexpected behaviour, such as
    /// the CPU ignoring the mapping change for some time.
    ///
    #[inline]
    pub fn ignore(self) {}
}

/// Describes an error encountered while trying to make a
/// new page mapping.
///
#[derive(Debug, PartialEq)]
pub enum PageMappingError {
    /// Failed to allocate a new physical memory frame
    /// for use as a new page table.
    PageTableAllocationFailed,
    /// Tried to create a new page mapping within a
    /// larger existing mapping, such as a 4 KiB page
    /// inside a 2 MiB page.
    LargerParentMappingExists,
    /// This virtual page is already mapped to a physical
    /// memory frame. The frame that is already mapped is
    /// returned.
    PageAlreadyMapped(PhysFrame),
    /// The provided physical frame cannot be used in a
    /// page table entry.
    InvalidPhysAddr(usize),
}

/// Describes an error encountered while trying to change
/// the flags on an existing page mapping.
///
#[derive(Debug, PartialEq)]
pub enum PageRemappingError {
    /// Tried to change a page mapping within a larger
    /// mapping, such as a 4 KiB page inside a 2 MiB
    /// page.
    LargerParentMappingExists,
    /// This virtual page is not mapped.
    PageNotMapped,
}

/// Describes an error encountered while trying to remove
/// a page mapping.
///
#[derive(Debug, PartialEq)]
pub enum PageUnmappingError {
    /// Tried to remove a page mapping within a larger
    /// mapping, such as a 4 KiB page inside a 2 MiB
    /// page.
    LargerParentMappingExists,
    /// This virtual page is not mapped.
    PageNotMapped,
}

/// Returns the index into the level 4 page table for the
/// given virtual address.
///
const fn level4_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 12 >> 9 >> 9 >> 9) & ENTRY_MASK
}

/// Returns the index into the level 3 page table for the
/// given virtual address.
///
const fn level3_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 12 >> 9 >> 9) & ENTRY_MASK
}

/// Returns the index into the level 2 page table for the
/// given virtual address.
///
const fn level2_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 12 >> 9) & ENTRY_MASK
}

/// Returns the index into the level 1 page table for the
/// given virtual address.
///
const fn level1_index(addr: VirtAddr) -> usize {
    (addr.as_usize() >> 12) & ENTRY_MASK
}

#[cfg(test)]
mod test {
    extern crate std;
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;
    use x86_64::structures::paging;
    use x86_64::structures::paging::Translate;

    #[test]
    fn test_page_table_indices() {
        let addr = VirtAddr::new(0xffff_8234_5678_9abc);
        assert_eq!(level4_index(addr), 260);
        assert_eq!(level3_index(addr), 209);
        assert_eq!(level2_index(addr), 179);
        assert_eq!(level1_index(addr), 393);
    }

    // This includes a byte array the same size as
    // a page table, aligned to frame boundaries.
    //
    // This can be allocated on the heap and should
    // have the correct alignment, allowing us to
    // use them as page tables with a physical
    // memory offset of 0.
    //
    #[derive(Clone)]
    #[repr(C)]
    #[repr(align(4096))]
    struct FakePageTable {
        entries: [u8; PhysFrameSize::Size4KiB.bytes()],
    }

    impl FakePageTable {
        fn new() -> Self {
            FakePageTable {
                entries: [0u8; PhysFrameSize::Size4KiB.bytes()],
            }
        }
    }

    // This is a "physical frame allocator" that
    // returns a virtual memory buffer that is not
    // otherwise in use. This means we can use it
    // to test page mapping with fake page tables
    // in userspace.
    //
    struct FakePhysFrameAllocator {
        buffers: Vec<Box<FakePageTable>>,
    }

    impl FakePhysFrameAllocator {
        fn new() -> Self {
            FakePhysFrameAllocator {
                buffers: Vec::new(),
            }
        }

        fn allocate(&mut self) -> PhysAddr {
            let next = Box::new(FakePageTable::new());
            let addr = PhysAddr::new(next.as_ref() as *const FakePageTable as usize);
            self.buffers.push(next);

            addr
        }
    }

    unsafe impl PhysFrameAllocator for FakePhysFrameAllocator {
        fn allocate_phys_frame(&mut self, size: PhysFrameSize) -> Option<PhysFrame> {
            if size != PhysFrameSize::Size4KiB {
                None
            } else {
                let addr = self.allocate();
                let frame = PhysFrame::from_start_address(addr, size)
                    .expect("got unaligned fake page table");
                Some(frame)
            }
        }

        fn allocate_phys_frame_below(
            &mut self,
            _size: PhysFrameSize,
            _limit: PhysAddr,
        ) -> Option<PhysFrame> {
            None
        }
    }

    struct TestCase {
        name: &'static str,
        virt_addr: VirtAddr,
        virt_addr_x86_64: x86_64::VirtAddr,
        phys_addr: PhysAddr,
        phys_addr_x86_64: x86_64::PhysAddr,
        page: VirtPage,
        frame: PhysFrame,
        page_size: VirtPageSize,
        frame_size: PhysFrameSize,
        flags_in: PageTableFlags,
        flags_out: PageTableFlags,
    }

    macro_rules! testcase {
        ($name:literal, $vaddr:expr, $paddr:expr, $size:ident, $($flags_in:ident)|+, $($flags_out:ident)|+,) => {
            TestCase {
                name: $name,
                virt_addr: VirtAddr::new($vaddr),
                virt_addr_x86_64: x86_64::VirtAddr::new($vaddr as u64),
                phys_addr: PhysAddr::new($paddr),
                phys_addr_x86_64: x86_64::PhysAddr::new($paddr as u64),
                page: VirtPage::from_start_address(VirtAddr::new($vaddr), VirtPageSize::$size)
                    .expect("VirtPage"),
                frame: PhysFrame::from_start_address(PhysAddr::new($paddr), PhysFrameSize::$size)
                    .expect("PhysFrame"),
                page_size: VirtPageSize::$size,
                frame_size: PhysFrameSize::$size,
                flags_in: $(PageTableFlags::$flags_in)|+,
                flags_out: $(PageTableFlags::$flags_out)|+,
            }
        };
    }

    // These are the mappings we want to create in the
    // test functions below.
    //
    fn test_cases() -> Vec<TestCase> {
        std::vec![
            testcase!(
                "4 KiB basic mapping",
                0x7123_4567_8000_usize,
                0x0007_edcb_a987_6000_usize,
                Size4KiB,
                PRESENT,
                PRESENT,
            ),
            testcase!(
                "4 KiB flags mapping",
                0x1000_usize,
                0x6000_usize,
                Size4KiB,
                PRESENT | USER_ACCESSIBLE | WRITE_THROUGH | NO_CACHE | WRITABLE | GLOBAL | NO_EXECUTE,
                PRESENT | USER_ACCESSIBLE | WRITE_THROUGH | NO_CACHE | WRITABLE | GLOBAL | NO_EXECUTE,
            ),
            testcase!(
                "2 MiB basic mapping",
                0x7234_5680_0000_usize,
                0x0007_1234_5660_0000_usize,
                Size2MiB,
                PRESENT,
                PRESENT | HUGE_PAGE,
            ),
            testcase!(
                "1 GiB basic mapping",
                0xffff_8765_4000_0000_usize,
                0x0007_7654_0000_0000_usize,
                Size1GiB,
                PRESENT,
                PRESENT | HUGE_PAGE,
            ),
        ]
    }

    macro_rules! check {
        ($page_table:expr, $mapping:expr) => {
            // Check that the page and frame match.
            assert_eq!(
                $page_table.translate_page($mapping.page),
                Some($mapping.frame),
                "{:?} translate_page",
                $mapping.name
            );

            // Check that the last address before the mapping
            // is not mapped.
            assert_eq!(
                $page_table.translate($mapping.virt_addr - 1),
                PageMapping::NotMapped,
                "{:?} translate last address before mapping",
                $mapping.name
            );

            // Check that the first address in the mapping
            // is mapped correctly.
            assert_eq!(
                $page_table.translate($mapping.virt_addr),
                PageMapping::Mapping {
                    frame: $mapping.frame,
                    addr: $mapping.phys_addr,
                    flags: $mapping.flags_out,
                },
                "{:?} translate first address in mapping",
                $mapping.name
            );

            // Check that the last address in the mapping
            // is mapped correctly.
            assert_eq!(
                $page_table.translate($mapping.virt_addr + $mapping.page_size.bytes() - 1),
                PageMapping::Mapping {
                    frame: $mapping.frame,
                    addr: $mapping.phys_addr + $mapping.frame_size.bytes() - 1,
                    flags: $mapping.flags_out,
                },
                "{:?} translate last address in mapping",
                $mapping.name
            );

            // Check that the first address after the
            // mapping is not mapped.
            assert_eq!(
                $page_table.translate($mapping.virt_addr + $mapping.page_size.bytes()),
                PageMapping::NotMapped,
                "{:?} translate first address after mapping",
                $mapping.name
            );
        };
    }

    // Test that the page mapping process works
    // correctly by making page mappings using
    // this implementation, then checking that
    // both the [`x86_64`] crate and this
    // implementation's translations agree.
    //
    #[test]
    fn test_page_table_map() {
        // We pretend that we're using physical memory by using
        // an offset of 0.
        let offset = VirtAddr::zero();
        let cases = test_cases();

        // Make the level-4 page table.
        let mut allocator = FakePhysFrameAllocator::new();
        let mut pml4 = Box::new(paging::PageTable::new());
        let pml4_addr = PhysAddr::new(pml4.as_ref() as *const paging::PageTable as usize);
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };

        // Make our mappings.

        for case in cases.iter() {
            unsafe {
                // Make the page mapping.
                page_table
                    .map(case.page, case.frame, case.flags_in, &mut allocator)
                    .expect(case.name)
                    .ignore();

                // Check that trying to make the
                // mapping again fails correctly.
                assert_eq!(
                    page_table
                        .map(case.page, case.frame, case.flags_in, &mut allocator)
                        .expect_err(case.name),
                    PageMappingError::PageAlreadyMapped(case.frame),
                    "{:?} second mapping",
                    case.name
                );
            }
        }

        // Check the translations.
        for case in cases.iter() {
            check!(page_table, case);
        }

        // Switch to the x86_64 page table and
        // check the translations again.
        drop(page_table);
        let offset_page_table =
            unsafe { paging::OffsetPageTable::new(pml4.as_mut(), offset.as_x86_64()) };

        for case in cases.iter() {
            assert_eq!(
                offset_page_table.translate_addr(case.virt_addr_x86_64),
                Some(case.phys_addr_x86_64),
                "{:?} x86_64::translate_addr first address in mapping",
                case.name
            );
            assert_eq!(
                offset_page_table.translate_addr(
                    case.virt_addr_x86_64 + case.page_size.bytes() as u64 - 1u64
                ),
                Some(case.phys_addr_x86_64 + case.frame_size.bytes() as u64 - 1u64),
                "{:?} x86_64::translate_addr last address in mapping",
                case.name
            );
        }

        // Switch back to our page table.
        drop(offset_page_table);
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };

        // Unmap each mapping, checking that we
        // get the right physical address back
        // and that the mapping is removed.
        for case in cases.iter() {
            let (frame, flush) = unsafe { page_table.unmap(case.page) }.expect(case.name);
            flush.ignore();
            assert_eq!(frame, case.frame, "{:?} unmap frame", case.name);
            assert_eq!(
                page_table.translate_page(case.page),
                None,
                "{:?} translate page after unmap",
                case.name
            );
        }
    }

    // Test the entry-level operations the memory manager
    // uses: parking a frame in a non-present entry,
    // replacing it, and clearing it.
    //
    #[test]
    fn test_parked_entries() {
        let offset = VirtAddr::zero();
        let mut allocator = FakePhysFrameAllocator::new();
        let mut pml4 = Box::new(paging::PageTable::new());
        let pml4_addr = PhysAddr::new(pml4.as_ref() as *const paging::PageTable as usize);
        let mut page_table = unsafe { PageTable::at_offset(pml4_addr, offset) };

        let size = VirtPageSize::Size4KiB;
        let page = VirtPage::from_start_address(VirtAddr::new(0x4000_0000), size).unwrap();
        let frame1 = PhysFrame::from_start_address(PhysAddr::new(0x8000), size.phys_frame_size())
            .unwrap();
        let frame2 = PhysFrame::from_start_address(PhysAddr::new(0xa000), size.phys_frame_size())
            .unwrap();

        // An untouched page reports nothing.
        assert_eq!(page_table.query(page.start_address()), None);

        // Park frame1 without the present flag. The CPU
        // cannot see it, but query can.
        let flags = PageTableFlags::NO_EXECUTE;
        let (prev, change) =
            unsafe { page_table.set_page(page, frame1, flags, &mut allocator) }.unwrap();
        change.ignore();
        assert_eq!(prev, None);
        assert_eq!(page_table.translate(page.start_address()), PageMapping::NotMapped);
        let info = page_table.query(page.start_address()).unwrap();
        assert_eq!(info.frame, frame1);
        assert!(info.flags.absent());
        assert!(!info.protection().present);

        // Replace it with a present, writable mapping of
        // frame2, as a write fault would.
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        let (prev, change) =
            unsafe { page_table.set_page(page, frame2, flags, &mut allocator) }.unwrap();
        change.ignore();
        assert_eq!(prev, Some(frame1));
        assert_eq!(page_table.translate_page(page), Some(frame2));
        let info = page_table.query(page.start_address()).unwrap();
        assert_eq!(info.frame, frame2);
        assert!(info.flags.present());
        assert!(info.flags.writable());

        // Clear the entry and check both views agree.
        let (prev, change) = unsafe { page_table.clear_page(page) }.unwrap();
        change.ignore();
        assert_eq!(prev, Some(frame2));
        assert_eq!(page_table.query(page.start_address()), None);
        assert_eq!(page_table.translate(page.start_address()), PageMapping::NotMapped);

        // Clearing an already-empty entry is fine.
        let (prev, change) = unsafe { page_table.clear_page(page) }.unwrap();
        change.ignore();
        assert_eq!(prev, None);

        // Unmapping an empty entry is an error, as before.
        assert_eq!(
            unsafe { page_table.unmap(page) }.unwrap_err(),
            PageUnmappingError::PageNotMapped
        );
    }
}
