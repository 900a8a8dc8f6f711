// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Address space contexts: a page table plus the range tree and
//! accounting describing what the address space holds.

use crate::backing::{FileView, MappedRegion};
use crate::range::{CowMode, MappedFile, PageRange, RangeTree};
use crate::{AccessKind, AllocFlags, Error, ProtFlags};
use align::align_up_usize;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use locks::{lock, SpinLock};
use memory::constants::{KERNEL_DYNAMIC, LOW_32BIT, USERSPACE};
use memory::{
    phys_to_virt_addr_at, PageInfo, PageMapping, PageProtection, PageTable, PageTableFlags,
    PhysAddr, PhysFrame, PhysFrameAllocator, PhysFrameDeallocator, PhysFrameSize, VirtAddr,
    VirtPage, VirtPageSize,
};
use physmem::{AllocateOptions, PageRegistry};
use pretty::Bytes;
use serial::println;

/// The id handed to the next context.
///
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Selects the span of the virtual address space a context
/// allocates from.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContextKind {
    /// The kernel's own context, allocating from the
    /// higher-half dynamic region.
    Kernel,

    /// A userspace process context, allocating from the
    /// lower half.
    User,
}

/// A context's memory accounting.
///
/// Every allocate, free and protect adjusts these so that an
/// allocation followed by its matching free restores the record
/// exactly.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    /// Bytes of committed memory: address space with backing.
    pub committed: usize,

    /// Bytes currently written out to swap.
    pub paged: usize,

    /// Bytes of memory eligible for swap-out.
    pub pageable: usize,

    /// Bytes of memory excluded from swap-out.
    pub non_paged: usize,

    /// Bytes of reserved address space that have not been
    /// committed.
    pub reserved: usize,
}

/// An address space context: a page table, the tree of page
/// ranges describing the address space, and accounting.
///
/// All mutation happens under the context's spinlock. Fault
/// handling, allocation and teardown from different CPUs are
/// serialised by it.
///
pub struct Context {
    pub(crate) id: u64,
    pub(crate) kind: ContextKind,
    pub(crate) registry: Arc<PageRegistry>,
    pub(crate) pml4: PhysFrame,
    pub(crate) inner: SpinLock<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) ranges: RangeTree,
    pub(crate) stats: MemoryStats,
}

impl Context {
    /// Creates an empty address space context drawing frames
    /// from the given registry.
    ///
    pub fn new(kind: ContextKind, registry: Arc<PageRegistry>) -> Result<Arc<Context>, Error> {
        let mut allocator = &*registry;
        let pml4 = allocator
            .allocate_phys_frame(PhysFrameSize::Size4KiB)
            .ok_or(Error::NotEnoughMemory)?;

        // A fresh table must be empty, or the context would
        // inherit stale translations.
        unsafe {
            let virt = phys_to_virt_addr_at(pml4.start_address(), registry.physmem_offset());
            ptr::write_bytes(virt.as_usize() as *mut u8, 0, pml4.size().bytes());
        }

        Ok(Arc::new(Context {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            registry,
            pml4,
            inner: SpinLock::new(ContextInner {
                ranges: RangeTree::new(),
                stats: MemoryStats::default(),
            }),
        }))
    }

    /// Returns the context's id.
    ///
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the context's kind.
    ///
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Returns the page registry the context draws frames
    /// from.
    ///
    pub fn registry(&self) -> &Arc<PageRegistry> {
        &self.registry
    }

    /// Returns a copy of the context's memory accounting.
    ///
    pub fn stats(&self) -> MemoryStats {
        lock!(self.inner).stats
    }

    /// Returns the number of ranges in the context's range
    /// tree.
    ///
    pub fn range_count(&self) -> usize {
        lock!(self.inner).ranges.len()
    }

    /// Returns a copy of the range containing the given
    /// address.
    ///
    pub fn range_at(&self, addr: VirtAddr) -> Option<PageRange> {
        lock!(self.inner).ranges.find_containing(addr).cloned()
    }

    /// Checks the range tree's invariants.
    ///
    /// # Panics
    ///
    /// `check_ranges` will panic if the tree holds an empty,
    /// misaligned or overlapping range.
    ///
    pub fn check_ranges(&self) {
        lock!(self.inner).ranges.check();
    }

    /// Reports the leaf page table entry covering the given
    /// address, if any.
    ///
    pub fn query(&self, addr: VirtAddr) -> Option<PageInfo> {
        let _inner = lock!(self.inner);
        unsafe { self.page_table() }.query(addr)
    }

    /// Returns a view of the context's page table.
    ///
    /// # Safety
    ///
    /// The view aliases the table's memory; callers must hold
    /// the context spinlock around any mutation.
    ///
    pub(crate) unsafe fn page_table(&self) -> PageTable {
        PageTable::at_offset(self.pml4.start_address(), self.registry.physmem_offset())
    }

    /// Prints the context's ranges and accounting.
    ///
    pub fn debug(&self) {
        let inner = lock!(self.inner);
        println!(
            "context {}: {} ranges, {} committed, {} reserved",
            self.id,
            inner.ranges.len(),
            Bytes::from_usize(inner.stats.committed),
            Bytes::from_usize(inner.stats.reserved),
        );
        for range in inner.ranges.iter() {
            println!(
                "  {:p} + {:7} {} {} {}",
                range.virt,
                Bytes::from_usize(range.size),
                if range.reserved { "reserved" } else { "mapped" },
                if range.pageable { "pageable" } else { "wired" },
                if range.mapped.is_some() { "file" } else { "anon" },
            );
        }
    }

    /// Selects the lowest base address at which a new range of
    /// `size` bytes would fit, honouring the context's span and
    /// the placement flags.
    ///
    fn find_available(&self, inner: &ContextInner, size: usize, flags: AllocFlags) -> Option<VirtAddr> {
        let page_size = if flags.contains(AllocFlags::HUGE_PAGE) {
            VirtPageSize::Size2MiB
        } else {
            VirtPageSize::Size4KiB
        };
        let pg = page_size.bytes();

        let (base, limit) = if flags.contains(AllocFlags::VIRT32) {
            (LOW_32BIT.start(), LOW_32BIT.end().as_usize() + 1)
        } else {
            match self.kind {
                ContextKind::User => (USERSPACE.start(), USERSPACE.end().as_usize() + 1),
                ContextKind::Kernel => (KERNEL_DYNAMIC.start(), KERNEL_DYNAMIC.end().as_usize() + 1),
            }
        };

        // First fit: walk the ranges in order, taking the
        // first gap that leaves a page of slack.
        let mut last = base.as_usize();
        for range in inner.ranges.iter() {
            if range.end() <= last {
                continue;
            }
            if range.virt.as_usize() >= limit {
                break;
            }

            // A range straddling the span start just moves
            // the cursor.
            let gap_start = align_up_usize(last, pg);
            if range.virt.as_usize() > gap_start
                && range.virt.as_usize() - gap_start >= size + pg
            {
                return Some(VirtAddr::new(gap_start));
            }

            last = range.end();
        }

        // No gap was big enough; append after the last range.
        let gap_start = align_up_usize(last, pg);
        if gap_start + size <= limit {
            Some(VirtAddr::new(gap_start))
        } else {
            None
        }
    }

    /// Carves out a new range of virtual memory.
    ///
    /// With no `base`, a base is chosen automatically. The
    /// backing is selected by `flags` and `file`: an address
    /// space reservation, demand-zero anonymous memory, eagerly
    /// allocated frames, or a window of a file through its page
    /// cache. Returns the first usable address, which is one
    /// page past the range start when a guard page was asked
    /// for.
    ///
    pub fn allocate(
        &self,
        base: Option<VirtAddr>,
        size: usize,
        prot: ProtFlags,
        flags: AllocFlags,
        file: Option<&FileView>,
    ) -> Result<VirtAddr, Error> {
        // Half the virtual address space bounds any sane
        // request and keeps the size arithmetic from
        // overflowing.
        if size == 0 || size >= 1 << 47 {
            return Err(Error::InvalidArgument);
        }

        let mut flags = flags;
        let mut prot = prot;
        let mut file = file;

        // A reservation has no backing, and a physically
        // constrained range cannot come from a cache.
        if flags.contains(AllocFlags::RESERVE) || flags.contains(AllocFlags::PHYS32) {
            file = None;
        }
        if file.is_some() && flags.contains(AllocFlags::NON_PAGED) {
            return Err(Error::InvalidArgument);
        }
        if file.is_some() {
            // Page caches work at the small page granularity.
            flags.remove(AllocFlags::HUGE_PAGE);
        }
        if flags.contains(AllocFlags::HUGE_PAGE)
            && !flags.intersects(AllocFlags::NON_PAGED | AllocFlags::RESERVE)
        {
            // The shared zero frame is small, so demand-zero
            // memory stays at the small granularity too.
            flags.remove(AllocFlags::HUGE_PAGE);
        }

        let huge = flags.contains(AllocFlags::HUGE_PAGE);
        let page_size = if huge {
            VirtPageSize::Size2MiB
        } else {
            VirtPageSize::Size4KiB
        };
        let pg = page_size.bytes();

        if let Some(requested) = base {
            if requested.is_zero() || !requested.is_aligned(pg) {
                return Err(Error::InvalidArgument);
            }
        }

        let mut size = size;
        let mut fileoff = 0_usize;
        let mut filesize = 0_usize;
        if let Some(view) = file {
            if !view.read {
                return Err(Error::AccessDenied);
            }

            fileoff = view.offset;
            let avail = match view.backing.file_size().checked_sub(fileoff) {
                Some(avail) if avail > 0 => avail,
                _ => return Err(Error::InvalidArgument),
            };

            size = cmp::min(size, avail);
            filesize = size;

            // A handle without write capability cannot produce
            // a writable shared mapping.
            if !view.write && !flags.contains(AllocFlags::PRIVATE) {
                prot |= ProtFlags::READ_ONLY;
            }
        }

        size = align_up_usize(size, pg);
        if flags.contains(AllocFlags::GUARD_PAGE) {
            size += pg;
        }

        // Warm the page cache before taking any locks; the
        // cache may sleep on its own mutex and on the driver.
        if let Some(view) = file {
            if flags.intersects(AllocFlags::PREFAULT | AllocFlags::PRIVATE) {
                view.backing.get_entry(fileoff, filesize)?;
            }
        }

        let mut requested = base;
        let mut inner = lock!(self.inner);
        let (chosen, commit_over) = loop {
            let candidate = match requested {
                Some(addr) => addr,
                None => self
                    .find_available(&inner, size, flags)
                    .ok_or(Error::NotEnoughMemory)?,
            };

            // The window's last byte must be a valid address.
            match candidate.as_usize().checked_add(size) {
                Some(end) if VirtAddr::try_new(end - 1).is_ok() => {}
                _ => return Err(Error::InvalidArgument),
            }

            match inner.ranges.find_intersecting(candidate, size) {
                None => break (candidate, false),
                Some(existing) if existing.reserved => {
                    // Committing part of a reservation. The
                    // window must lie entirely inside it and
                    // match its granularity.
                    if candidate.as_usize() < existing.virt.as_usize()
                        || candidate.as_usize() + size > existing.end()
                    {
                        return Err(Error::InUse);
                    }
                    if existing.prot.huge_page != huge {
                        return Err(Error::InvalidArgument);
                    }

                    break (candidate, true);
                }
                Some(_) => {
                    if flags.contains(AllocFlags::HINT) && requested.is_some() {
                        requested = None;
                        continue;
                    }

                    return Err(Error::InUse);
                }
            }
        };

        // Reservations commit anonymous memory only; a file
        // cannot land inside one.
        if commit_over && file.is_some() {
            return Err(Error::InvalidArgument);
        }

        // Already-committed pages inside a reservation are a
        // collision: this is what tells a caller probing a
        // reservation page by page that the page is live.
        if commit_over {
            let pt = unsafe { self.page_table() };
            let mut addr = chosen;
            while addr.as_usize() < chosen.as_usize() + size {
                if pt.query(addr).is_some() {
                    return Err(Error::InUse);
                }
                addr += pg;
            }
        }

        let data_base = if flags.contains(AllocFlags::GUARD_PAGE) {
            chosen + pg
        } else {
            chosen
        };

        // The protection record the pages will carry. When
        // committing a reservation the reservation's record
        // wins, so the whole span stays uniform.
        let mut rprot = if commit_over {
            let existing = inner.ranges.find_containing(chosen).unwrap();
            let mut rprot = existing.prot;
            rprot.present = true;
            rprot
        } else {
            let mut rprot = PageProtection::empty();
            rprot.present = !flags.contains(AllocFlags::RESERVE);
            rprot.huge_page = huge;
            rprot.executable = prot.contains(ProtFlags::EXECUTABLE);
            rprot.user = prot.contains(ProtFlags::USER);
            rprot.ro = prot.contains(ProtFlags::READ_ONLY);
            rprot.rw = !rprot.ro;
            rprot.uncached = prot.contains(ProtFlags::CACHE_DISABLE);
            rprot
        };
        rprot.is_swap_phys = false;

        let cow = if file.is_some() && flags.contains(AllocFlags::PRIVATE) {
            CowMode::Symmetric
        } else if file.is_none()
            && !flags.intersects(AllocFlags::NON_PAGED | AllocFlags::RESERVE)
        {
            CowMode::Asymmetric
        } else {
            CowMode::None
        };

        // Register the mapping with the page cache's reverse
        // index before installing anything that refers to it.
        let mapped = file.map(|view| {
            let region = view.backing.attach_mapping(MappedRegion {
                fileoff,
                size: filesize,
                virt: data_base,
                context: self.id,
            });
            if flags.contains(AllocFlags::PRIVATE) {
                view.backing.note_private_mapping();
            }

            MappedFile {
                backing: view.backing.clone(),
                region,
                base: data_base,
                fileoff,
            }
        });

        // Install the page table entries.
        if let Err(err) = self.install_pages(chosen, size, page_size, rprot, flags, &mapped) {
            if let Some(mapped) = &mapped {
                mapped.backing.detach_mapping(mapped.region);
            }

            return Err(err);
        }

        // Update the tree and the accounting. Committed bytes
        // are accounted against the reservation's own swap
        // eligibility, so the later free balances.
        let mut stats_pageable = !flags.contains(AllocFlags::NON_PAGED);
        if commit_over {
            let range = inner.ranges.find_containing_mut(chosen).unwrap();
            range.size_committed += size;
            if range.size_committed >= range.size {
                range.reserved = false;
            }
            if cow == CowMode::Asymmetric {
                range.cow = CowMode::Asymmetric;
            }
            stats_pageable = range.pageable;
        } else {
            inner.ranges.insert(PageRange {
                virt: chosen,
                size,
                prot: rprot,
                pageable: !flags.contains(AllocFlags::NON_PAGED),
                reserved: flags.contains(AllocFlags::RESERVE),
                size_committed: if flags.contains(AllocFlags::RESERVE) {
                    0
                } else {
                    size
                },
                has_guard_page: flags.contains(AllocFlags::GUARD_PAGE),
                cow,
                phys32: flags.contains(AllocFlags::PHYS32),
                mapped,
                working_set: Vec::new(),
            });
        }

        if flags.contains(AllocFlags::RESERVE) {
            inner.stats.reserved += size;
        } else {
            let accounted = size
                - if flags.contains(AllocFlags::GUARD_PAGE) {
                    pg
                } else {
                    0
                };
            if stats_pageable {
                inner.stats.pageable += accounted;
            } else {
                inner.stats.non_paged += accounted;
            }
            inner.stats.committed += accounted;
            if commit_over {
                inner.stats.reserved -= accounted;
            }
        }

        Ok(data_base)
    }

    /// Installs the page table entries for a new or committed
    /// range, rolling back on failure.
    ///
    fn install_pages(
        &self,
        base: VirtAddr,
        size: usize,
        page_size: VirtPageSize,
        rprot: PageProtection,
        flags: AllocFlags,
        mapped: &Option<MappedFile>,
    ) -> Result<(), Error> {
        if flags.contains(AllocFlags::RESERVE) {
            // A reservation installs nothing.
            return Ok(());
        }

        let pg = page_size.bytes();
        let mut pt = unsafe { self.page_table() };
        let table_flags = rprot.table_flags();

        let mut addr = base;
        while addr.as_usize() < base.as_usize() + size {
            let page = VirtPage::from_start_address(addr, page_size).unwrap();
            let guard_page = flags.contains(AllocFlags::GUARD_PAGE) && addr == base;

            let result = if guard_page {
                Ok(())
            } else if let Some(mapped) = mapped {
                self.install_file_page(&mut pt, page, mapped, table_flags, flags)
            } else if flags.contains(AllocFlags::NON_PAGED) {
                self.install_wired_page(&mut pt, page, table_flags, flags)
            } else {
                self.install_demand_zero_page(&mut pt, page, table_flags)
            };

            if let Err(err) = result {
                self.rollback_pages(&mut pt, base, addr, page_size);
                return Err(err);
            }

            addr += pg;
        }

        Ok(())
    }

    /// Parks the shared zero frame in a non-present entry, to
    /// be promoted or peeled by the fault handler.
    ///
    fn install_demand_zero_page(
        &self,
        pt: &mut PageTable,
        page: VirtPage,
        table_flags: PageTableFlags,
    ) -> Result<(), Error> {
        let anon = self.registry.anon_frame();
        let flags = table_flags & !(PageTableFlags::PRESENT | PageTableFlags::WRITABLE);

        let mut allocator = &*self.registry;
        let (previous, change) = unsafe { pt.set_page(page, anon, flags, &mut allocator) }
            .map_err(|_| Error::NotEnoughMemory)?;
        debug_assert!(previous.is_none());
        change.flush_if(false);

        self.registry.ref_frame(anon.start_address());
        Ok(())
    }

    /// Allocates and maps a frame immediately.
    ///
    fn install_wired_page(
        &self,
        pt: &mut PageTable,
        page: VirtPage,
        table_flags: PageTableFlags,
        flags: AllocFlags,
    ) -> Result<(), Error> {
        let mut options = AllocateOptions::new();
        options.phys32 = flags.contains(AllocFlags::PHYS32);
        options.huge = page.size() == VirtPageSize::Size2MiB;
        options.zero = true;

        let frame = self
            .registry
            .allocate(options)
            .ok_or(Error::NotEnoughMemory)?;

        let mut allocator = &*self.registry;
        match unsafe { pt.set_page(page, frame, table_flags, &mut allocator) } {
            Ok((previous, change)) => {
                debug_assert!(previous.is_none());
                change.flush_if(false);
                Ok(())
            }
            Err(_) => {
                self.registry.deref_frame(frame.start_address());
                Err(Error::NotEnoughMemory)
            }
        }
    }

    /// Maps a cached file page read-only if the cache already
    /// holds it; otherwise leaves the entry empty for the
    /// fault handler to fill.
    ///
    fn install_file_page(
        &self,
        pt: &mut PageTable,
        page: VirtPage,
        mapped: &MappedFile,
        table_flags: PageTableFlags,
        flags: AllocFlags,
    ) -> Result<(), Error> {
        if !flags.intersects(AllocFlags::PREFAULT | AllocFlags::PRIVATE) {
            // Lazy: the first access pages it in.
            return Ok(());
        }

        let fileoff = mapped.file_offset(page.start_address());
        let frame = match mapped.backing.cached_frame(fileoff) {
            Some(frame) => frame,
            // The cache was warmed, but this page is beyond
            // what it holds; leave it to fault in.
            None => return Ok(()),
        };

        // Both shared and private file pages start read-only:
        // shared so the first write can be recorded as dirty,
        // private so the first write peels a copy.
        let flags = (table_flags | PageTableFlags::PRESENT) & !PageTableFlags::WRITABLE;
        let mut allocator = &*self.registry;
        let (previous, change) = unsafe { pt.set_page(page, frame, flags, &mut allocator) }
            .map_err(|_| Error::NotEnoughMemory)?;
        debug_assert!(previous.is_none());
        change.flush_if(false);

        self.registry.ref_frame(frame.start_address());
        Ok(())
    }

    /// Tears down the entries installed so far by a failed
    /// allocation.
    ///
    fn rollback_pages(
        &self,
        pt: &mut PageTable,
        base: VirtAddr,
        upto: VirtAddr,
        page_size: VirtPageSize,
    ) {
        let pg = page_size.bytes();
        let mut addr = base;
        while addr < upto {
            let page = VirtPage::from_start_address(addr, page_size).unwrap();
            if let Ok((Some(frame), change)) = unsafe { pt.clear_page(page) } {
                change.flush_if(true);
                if self.registry.lookup(frame.start_address()).is_some() {
                    self.registry.deref_frame(frame.start_address());
                }
            }

            addr += pg;
        }
    }

    /// Releases the given window of virtual memory.
    ///
    /// If the window covers an entire range, the range is
    /// removed; otherwise the range is split and only the
    /// window's pages are released. The window must lie within
    /// a single range.
    ///
    pub fn free(&self, base: VirtAddr, size: usize) -> Result<(), Error> {
        if base.is_zero() || size == 0 || size >= 1 << 47 {
            return Err(Error::InvalidArgument);
        }

        let small = VirtPageSize::Size4KiB.bytes();
        let mut base = base.align_down(small);
        let mut size = align_up_usize(size, small);

        let mut inner = lock!(self.inner);
        let range = match inner.ranges.find_intersecting(base, size) {
            Some(range) => range,
            None => return Err(Error::NotFound),
        };

        let pg = range.page_size().bytes();
        let range_virt = range.virt;
        let range_size = range.size;
        let range_end = range.end();

        // Freeing from the address we handed out releases the
        // hidden guard page with it.
        if range.has_guard_page && base.as_usize() == range_virt.as_usize() + pg {
            base -= pg;
            size += pg;
        }

        if base.as_usize() < range_virt.as_usize()
            || base.as_usize().saturating_add(size) > range_end
        {
            return Err(Error::InvalidArgument);
        }
        if !base.is_aligned(pg) || size % pg != 0 {
            // A huge range can only be carved at its own
            // granularity.
            return Err(Error::InvalidArgument);
        }

        let was_reserved = range.reserved;
        let was_pageable = range.pageable;
        let had_guard = range.has_guard_page;

        // Split the tree first, so the survivors are in place
        // before the entries go away.
        let full = base == range_virt && size == range_size;
        if full {
            let removed = inner.ranges.remove(range_virt).unwrap();
            if let Some(mapped) = &removed.mapped {
                mapped.backing.detach_mapping(mapped.region);
            }
        } else {
            self.split_out_window(&mut inner, range_virt, base, size);
            inner.ranges.check();
        }

        // Release the window's pages.
        let mut pt = unsafe { self.page_table() };
        let page_size = if pg == VirtPageSize::Size2MiB.bytes() {
            VirtPageSize::Size2MiB
        } else {
            VirtPageSize::Size4KiB
        };
        let mut committed_bytes = 0_usize;
        let mut addr = base;
        while addr.as_usize() < base.as_usize() + size {
            let page = VirtPage::from_start_address(addr, page_size).unwrap();
            if let Ok((Some(frame), change)) = unsafe { pt.clear_page(page) } {
                change.flush_if(true);
                committed_bytes += pg;
                if self.registry.lookup(frame.start_address()).is_some() {
                    self.registry.deref_frame(frame.start_address());
                }
            }

            addr += pg;
        }

        // Adjust the accounting. Reserved ranges are split by
        // what was actually committed; ordinary ranges by the
        // window, less the guard page, which was never counted.
        let guard_freed = had_guard && base == range_virt;
        if was_reserved {
            inner.stats.committed -= committed_bytes;
            inner.stats.reserved -= size - committed_bytes;
            if was_pageable {
                inner.stats.pageable -= committed_bytes;
            } else {
                inner.stats.non_paged -= committed_bytes;
            }
        } else {
            let accounted = size - if guard_freed { pg } else { 0 };
            inner.stats.committed -= accounted;
            if was_pageable {
                inner.stats.pageable -= accounted;
            } else {
                inner.stats.non_paged -= accounted;
            }
        }

        Ok(())
    }

    /// Splits the range starting at `range_virt` so that the
    /// window `[base, base + size)` stands alone, and removes
    /// the window's part from the tree. Working-set entries
    /// are re-homed into the survivors.
    ///
    fn split_out_window(
        &self,
        inner: &mut ContextInner,
        range_virt: VirtAddr,
        base: VirtAddr,
        size: usize,
    ) {
        let mut range = inner.ranges.remove(range_virt).unwrap();
        let window_end = base.as_usize() + size;

        let keep_before = base.as_usize() > range.virt.as_usize();
        let keep_after = window_end < range.end();

        let mut before = if keep_before {
            let mut before = range.clone();
            before.size = base - range.virt;
            before.working_set = Vec::new();
            Some(before)
        } else {
            None
        };

        let mut after = if keep_after {
            let mut after = range.clone();
            after.virt = VirtAddr::new(window_end);
            // The tail's size falls straight out of the
            // original bounds.
            after.size = range.virt.as_usize() + range.size - window_end;
            after.has_guard_page = false;
            after.working_set = Vec::new();
            Some(after)
        } else {
            None
        };

        // Re-home the working-set entries by address; pages
        // inside the window are gone.
        for page in range.working_set.drain(..) {
            let addr = page.start_address().as_usize();
            if addr < base.as_usize() {
                if let Some(before) = &mut before {
                    before.working_set.push(page);
                }
            } else if addr >= window_end {
                if let Some(after) = &mut after {
                    after.working_set.push(page);
                }
            }
        }

        // Committed sizes follow the byte counts; a window of
        // a partially committed reservation cannot be told
        // apart per page here, so the survivors inherit the
        // commitment proportionally to their entries, which
        // the callers recompute from the page table anyway.
        if let Some(mut before) = before.take() {
            if before.reserved {
                before.size_committed = cmp::min(before.size_committed, before.size);
            } else {
                before.size_committed = before.size;
            }
            self.reattach_mapping(&mut before);
            inner.ranges.insert(before);
        }

        if let Some(mut after) = after.take() {
            if after.reserved {
                after.size_committed = cmp::min(after.size_committed, after.size);
            } else {
                after.size_committed = after.size;
            }
            self.reattach_mapping(&mut after);
            inner.ranges.insert(after);
        }

        // The original mapping record is superseded by the
        // survivors' records.
        if let Some(mapped) = &range.mapped {
            mapped.backing.detach_mapping(mapped.region);
        }
    }

    /// Gives a split survivor its own mapped-region record in
    /// place of the record it shared with the original range.
    ///
    fn reattach_mapping(&self, part: &mut PageRange) {
        let mapped = match &part.mapped {
            Some(mapped) => mapped.clone(),
            None => return,
        };

        let region = mapped.backing.attach_mapping(MappedRegion {
            fileoff: mapped.file_offset(part.virt),
            size: part.size,
            virt: part.virt,
            context: self.id,
        });
        part.mapped = Some(MappedFile {
            backing: mapped.backing,
            region,
            base: mapped.base,
            fileoff: mapped.fileoff,
        });
    }

    /// Changes the protection of the given window of virtual
    /// memory, splitting its range as needed to isolate it.
    ///
    /// With [`SAME_AS_BEFORE`](ProtFlags::SAME_AS_BEFORE), only
    /// the set bits are applied to the existing protection;
    /// otherwise the protection is replaced. `pageable` adjusts
    /// swap eligibility, with `None` keeping the current value.
    /// At each page, presence is preserved from what the table
    /// currently holds.
    ///
    pub fn protect(
        &self,
        base: VirtAddr,
        size: usize,
        prot: ProtFlags,
        pageable: Option<bool>,
    ) -> Result<(), Error> {
        let small = VirtPageSize::Size4KiB.bytes();
        if base.is_zero() || size == 0 || size >= 1 << 47 || !base.is_aligned(small) {
            return Err(Error::InvalidArgument);
        }
        if prot == ProtFlags::SAME_AS_BEFORE && pageable.is_none() {
            // Nothing to change.
            return Ok(());
        }

        let size = align_up_usize(size, small);

        let mut inner = lock!(self.inner);
        let range = match inner.ranges.find_intersecting(base, size) {
            Some(range) => range,
            None => return Err(Error::NotFound),
        };

        let range_virt = range.virt;
        let range_size = range.size;
        let range_pg = range.page_size().bytes();
        if base.as_usize() < range_virt.as_usize()
            || base.as_usize().saturating_add(size) > range.end()
        {
            return Err(Error::InvalidArgument);
        }
        if !base.is_aligned(range_pg) || size % range_pg != 0 {
            // A huge range can only be carved at its own
            // granularity.
            return Err(Error::InvalidArgument);
        }

        let mut new_prot = range.prot;
        if !prot.contains(ProtFlags::SAME_AS_BEFORE) {
            new_prot.executable = prot.contains(ProtFlags::EXECUTABLE);
            new_prot.user = prot.contains(ProtFlags::USER);
            new_prot.ro = prot.contains(ProtFlags::READ_ONLY);
            new_prot.rw = !new_prot.ro;
            new_prot.uncached = prot.contains(ProtFlags::CACHE_DISABLE);
        } else {
            if prot.contains(ProtFlags::EXECUTABLE) {
                new_prot.executable = true;
            }
            if prot.contains(ProtFlags::USER) {
                new_prot.user = true;
            }
            if prot.contains(ProtFlags::READ_ONLY) {
                new_prot.ro = true;
                new_prot.rw = false;
            }
            if prot.contains(ProtFlags::CACHE_DISABLE) {
                new_prot.uncached = true;
            }
            if prot.contains(ProtFlags::CACHE_ENABLE) {
                new_prot.uncached = false;
            }
        }

        let cow = range.cow;
        let was_pageable = range.pageable;
        let new_pageable = pageable.unwrap_or(was_pageable);
        let was_reserved = range.reserved;
        let had_guard = range.has_guard_page;

        // Isolate the window in its own range.
        let full = base == range_virt && size == range_size;
        if full {
            let range = inner.ranges.find_containing_mut(base).unwrap();
            range.prot = new_prot;
            range.pageable = new_pageable;
            if !new_pageable {
                // Wired pages are not replacement candidates.
                range.working_set.clear();
            }
        } else {
            self.split_for_protect(&mut inner, range_virt, base, size, new_prot, new_pageable);
            inner.ranges.check();
        }

        // Apply the new protection to the live entries,
        // preserving each page's presence. Copy-on-write
        // pages that have not yet been peeled stay read-only
        // whatever the new protection says.
        let pg = if new_prot.huge_page {
            VirtPageSize::Size2MiB
        } else {
            VirtPageSize::Size4KiB
        };
        let mut pt = unsafe { self.page_table() };
        let mut allocator = &*self.registry;
        let mut addr = base;
        while addr.as_usize() < base.as_usize() + size {
            let page = VirtPage::from_start_address(addr, pg).unwrap();
            if let Some(info) = pt.query(addr) {
                let mut page_prot = new_prot;
                page_prot.present = info.flags.present();
                page_prot.is_swap_phys = info.protection().is_swap_phys;
                if cow != CowMode::None && info.flags.read_only() {
                    page_prot.rw = false;
                    page_prot.ro = true;
                }

                let flags = page_prot.table_flags();
                let (_, change) = unsafe { pt.set_page(page, info.frame, flags, &mut allocator) }
                    .map_err(|_| Error::NotEnoughMemory)?;
                change.flush_if(true);
            }

            addr += pg.bytes();
        }

        // Swap eligibility moved between the pageable and
        // wired pools.
        if !was_reserved && was_pageable != new_pageable {
            let guard_in_window = had_guard && base == range_virt;
            let accounted = size - if guard_in_window { pg.bytes() } else { 0 };
            if new_pageable {
                inner.stats.non_paged -= accounted;
                inner.stats.pageable += accounted;
            } else {
                inner.stats.pageable -= accounted;
                inner.stats.non_paged += accounted;
            }
        }

        Ok(())
    }

    /// Splits the range starting at `range_virt` so the window
    /// `[base, base + size)` becomes its own range carrying the
    /// new protection, with working-set entries re-homed.
    ///
    fn split_for_protect(
        &self,
        inner: &mut ContextInner,
        range_virt: VirtAddr,
        base: VirtAddr,
        size: usize,
        new_prot: PageProtection,
        new_pageable: bool,
    ) {
        let mut range = inner.ranges.remove(range_virt).unwrap();
        let window_end = base.as_usize() + size;

        let keep_before = base.as_usize() > range.virt.as_usize();
        let keep_after = window_end < range.end();

        let mut middle = range.clone();
        middle.virt = base;
        middle.size = size;
        middle.prot = new_prot;
        middle.pageable = new_pageable;
        middle.working_set = Vec::new();
        middle.has_guard_page = range.has_guard_page && base == range.virt;
        if !middle.reserved {
            middle.size_committed = middle.size;
        }

        let mut before = if keep_before {
            let mut before = range.clone();
            before.size = base - range.virt;
            before.working_set = Vec::new();
            if !before.reserved {
                before.size_committed = before.size;
            }
            Some(before)
        } else {
            None
        };

        let mut after = if keep_after {
            let mut after = range.clone();
            after.virt = VirtAddr::new(window_end);
            after.size = range.virt.as_usize() + range.size - window_end;
            after.has_guard_page = false;
            after.working_set = Vec::new();
            if !after.reserved {
                after.size_committed = after.size;
            }
            Some(after)
        } else {
            None
        };

        // Re-home the working-set entries by address. Entries
        // moving into a range that is no longer pageable are
        // dropped; wired pages are not replacement candidates.
        for page in range.working_set.drain(..) {
            let addr = page.start_address().as_usize();
            if addr < base.as_usize() {
                if let Some(before) = &mut before {
                    before.working_set.push(page);
                }
            } else if addr >= window_end {
                if let Some(after) = &mut after {
                    after.working_set.push(page);
                }
            } else if new_pageable {
                middle.working_set.push(page);
            }
        }

        // The split ranges share the original mapping record;
        // each survivor gets its own.
        if let Some(before) = &mut before {
            self.reattach_mapping(before);
        }
        if let Some(after) = &mut after {
            self.reattach_mapping(after);
        }
        self.reattach_mapping(&mut middle);
        if let Some(mapped) = &range.mapped {
            mapped.backing.detach_mapping(mapped.region);
        }

        if let Some(before) = before {
            inner.ranges.insert(before);
        }
        inner.ranges.insert(middle);
        if let Some(after) = after {
            inner.ranges.insert(after);
        }
    }

    /// Copies bytes out of the context's virtual memory into a
    /// kernel buffer, resolving faults as a CPU read would.
    ///
    pub fn read_bytes(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Error> {
        let small = VirtPageSize::Size4KiB.bytes();
        let mut pos = 0_usize;
        while pos < buf.len() {
            let current = addr + pos;
            let phys = self.resolve(current, AccessKind::Read)?;

            let page_end = (current.as_usize() & !(small - 1)) + small;
            let n = cmp::min(buf.len() - pos, page_end - current.as_usize());
            let src = phys_to_virt_addr_at(phys, self.registry.physmem_offset());
            unsafe {
                ptr::copy_nonoverlapping(
                    src.as_usize() as *const u8,
                    buf[pos..].as_mut_ptr(),
                    n,
                );
            }

            pos += n;
        }

        Ok(())
    }

    /// Copies bytes from a kernel buffer into the context's
    /// virtual memory, resolving faults as a CPU write would.
    ///
    pub fn write_bytes(&self, addr: VirtAddr, buf: &[u8]) -> Result<(), Error> {
        let small = VirtPageSize::Size4KiB.bytes();
        let mut pos = 0_usize;
        while pos < buf.len() {
            let current = addr + pos;
            let phys = self.resolve(current, AccessKind::Write)?;

            let page_end = (current.as_usize() & !(small - 1)) + small;
            let n = cmp::min(buf.len() - pos, page_end - current.as_usize());
            let dst = phys_to_virt_addr_at(phys, self.registry.physmem_offset());
            unsafe {
                ptr::copy_nonoverlapping(
                    buf[pos..].as_ptr(),
                    dst.as_usize() as *mut u8,
                    n,
                );
            }

            pos += n;
        }

        Ok(())
    }

    /// Resolves the physical address behind a virtual address
    /// for the given kind of access, faulting pages in as a
    /// CPU access would.
    ///
    fn resolve(&self, addr: VirtAddr, access: AccessKind) -> Result<PhysAddr, Error> {
        // A resolved fault makes the access possible, so one
        // retry suffices; the bound guards against a broken
        // transition looping forever.
        for _ in 0..8 {
            {
                let _inner = lock!(self.inner);
                let pt = unsafe { self.page_table() };
                if let PageMapping::Mapping { addr: phys, flags, .. } = pt.translate(addr) {
                    let ok = match access {
                        AccessKind::Read => true,
                        AccessKind::Write => flags.writable(),
                        AccessKind::Execute => flags.executable(),
                    };
                    if ok {
                        return Ok(phys);
                    }
                }
            }

            self.fault(addr, access)?;
        }

        Err(Error::AccessDenied)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Tear down every range: detach cache records, drop
        // frame references, and release the paging structures.
        let ranges: Vec<PageRange> = {
            let mut inner = lock!(self.inner);
            inner.ranges.drain().collect()
        };

        let mut pt = unsafe { self.page_table() };
        for range in ranges {
            if let Some(mapped) = &range.mapped {
                mapped.backing.detach_mapping(mapped.region);
            }

            let page_size = range.page_size();
            let pg = page_size.bytes();
            let mut addr = range.virt;
            while addr.as_usize() < range.end() {
                let page = VirtPage::from_start_address(addr, page_size).unwrap();
                if let Ok((Some(frame), change)) = unsafe { pt.clear_page(page) } {
                    change.flush_if(true);
                    if self.registry.lookup(frame.start_address()).is_some() {
                        self.registry.deref_frame(frame.start_address());
                    }
                }

                addr += pg;
            }
        }

        drop(pt);

        // Free the paging structures themselves, leaves first.
        let mut allocator = &*self.registry;
        unsafe {
            free_child_tables(4, self.pml4, self.registry.physmem_offset(), &mut allocator);
            allocator.deallocate_phys_frame(self.pml4);
        }
    }
}

/// Frees every child page table reachable from the given table
/// frame. Leaf frames are not touched; they were released by the
/// range teardown.
///
unsafe fn free_child_tables<A>(
    level: u8,
    table: PhysFrame,
    physmem_offset: VirtAddr,
    allocator: &mut A,
) where
    A: PhysFrameAllocator + PhysFrameDeallocator + ?Sized,
{
    if level <= 1 {
        return;
    }

    let view = PageTable::at_offset(table.start_address(), physmem_offset);
    let mut children: [Option<PhysFrame>; 512] = [None; 512];
    for (i, entry) in view.iter().enumerate() {
        if entry.is_present() && entry.flags().small() {
            children[i] = Some(PhysFrame::containing_address(
                entry.addr(),
                PhysFrameSize::Size4KiB,
            ));
        }
    }

    for child in children.iter().flatten() {
        free_child_tables(level - 1, *child, physmem_offset, allocator);
        allocator.deallocate_phys_frame(*child);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use emumem::EmulatedMemory;

    const PAGE: usize = 4096;

    fn new_context(kind: ContextKind, frames: usize) -> (EmulatedMemory, Arc<Context>) {
        let mem = EmulatedMemory::new(frames);
        let registry = Arc::new(mem.registry());
        let ctx = Context::new(kind, registry).unwrap();
        (mem, ctx)
    }

    #[test]
    fn test_find_available_first_fit() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);

        // The first allocation lands at the bottom of the
        // user span; the second lands after it, with a page
        // of slack in between on automatic placement.
        let first = ctx
            .allocate(None, 2 * PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert_eq!(first, USERSPACE.start());

        let second = ctx
            .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert_eq!(second, first + 2 * PAGE);

        // Freeing the first range reopens its gap, and the
        // next fit takes it.
        ctx.free(first, 2 * PAGE).unwrap();
        let third = ctx
            .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn test_fixed_base_and_hint() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);

        let base = VirtAddr::new(0x5000_0000);
        let got = ctx
            .allocate(Some(base), PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert_eq!(got, base);

        // A straight collision fails.
        assert_eq!(
            ctx.allocate(Some(base), PAGE, ProtFlags::empty(), AllocFlags::empty(), None),
            Err(Error::InUse)
        );

        // With the hint flag the base is reselected instead.
        let moved = ctx
            .allocate(Some(base), PAGE, ProtFlags::empty(), AllocFlags::HINT, None)
            .unwrap();
        assert_ne!(moved, base);
        ctx.check_ranges();
    }

    #[test]
    fn test_low_32bit_window() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);

        let base = ctx
            .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::VIRT32, None)
            .unwrap();
        assert!(base.as_usize() >= 0x1000);
        assert!(base.as_usize() + PAGE <= 0xffff_f000);
    }

    #[test]
    fn test_invalid_arguments() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);

        // Zero size.
        assert_eq!(
            ctx.allocate(None, 0, ProtFlags::empty(), AllocFlags::empty(), None),
            Err(Error::InvalidArgument)
        );

        // Misaligned base.
        assert_eq!(
            ctx.allocate(
                Some(VirtAddr::new(0x5000_0123)),
                PAGE,
                ProtFlags::empty(),
                AllocFlags::empty(),
                None
            ),
            Err(Error::InvalidArgument)
        );

        // Freeing nothing.
        assert_eq!(ctx.free(VirtAddr::zero(), PAGE), Err(Error::InvalidArgument));
        assert_eq!(
            ctx.free(VirtAddr::new(0x6000_0000), PAGE),
            Err(Error::NotFound)
        );
        assert_eq!(
            ctx.protect(VirtAddr::new(0x6000_0000), PAGE, ProtFlags::READ_ONLY, None),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_partial_free_splits_range() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, 4 * PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();

        ctx.free(base + PAGE, 2 * PAGE).unwrap();
        ctx.check_ranges();

        // Exactly two survivors: one page at each end.
        assert_eq!(ctx.range_count(), 2);
        let head = ctx.range_at(base).unwrap();
        assert_eq!(head.virt, base);
        assert_eq!(head.size, PAGE);
        let tail = ctx.range_at(base + 3 * PAGE).unwrap();
        assert_eq!(tail.virt, base + 3 * PAGE);
        assert_eq!(tail.size, PAGE);

        // The freed middle faults; the ends are usable.
        assert_eq!(
            ctx.read_bytes(base + PAGE + PAGE / 2, &mut [0u8; 1]),
            Err(Error::AccessDenied)
        );
        ctx.write_bytes(base, &[1]).unwrap();
        ctx.write_bytes(base + 3 * PAGE, &[2]).unwrap();
    }

    #[test]
    fn test_split_sizes_rehome_working_set() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, 4 * PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();

        // Touch every page so each lands in the working set.
        let mut buf = [0u8; 4 * PAGE];
        ctx.read_bytes(base, &mut buf).unwrap();
        assert_eq!(ctx.range_at(base).unwrap().working_set.len(), 4);

        ctx.free(base + PAGE, 2 * PAGE).unwrap();

        // The tail's size must fall out of the original
        // bounds: virt + size - (base + size).
        let head = ctx.range_at(base).unwrap();
        let tail = ctx.range_at(base + 3 * PAGE).unwrap();
        assert_eq!(tail.size, base.as_usize() + 4 * PAGE - (base.as_usize() + 3 * PAGE));

        // Every working-set entry sits inside its own range,
        // and the freed window's entries are gone.
        assert_eq!(head.working_set.len(), 1);
        assert!(head.contains(head.working_set[0].start_address()));
        assert_eq!(tail.working_set.len(), 1);
        assert!(tail.contains(tail.working_set[0].start_address()));
    }

    #[test]
    fn test_protect_splits_range() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, 4 * PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();

        // Fault everything in as writable first.
        for i in 0..4 {
            ctx.write_bytes(base + i * PAGE, &[i as u8]).unwrap();
        }

        ctx.protect(base + PAGE, 2 * PAGE, ProtFlags::READ_ONLY, None)
            .unwrap();
        ctx.check_ranges();

        // Three ranges now, with differing protections.
        assert_eq!(ctx.range_count(), 3);
        assert!(!ctx.range_at(base).unwrap().prot.ro);
        assert!(ctx.range_at(base + PAGE).unwrap().prot.ro);
        assert!(ctx.range_at(base + 2 * PAGE).unwrap().prot.ro);
        assert!(!ctx.range_at(base + 3 * PAGE).unwrap().prot.ro);

        // The page table agrees, inside and outside the
        // window.
        assert!(ctx.query(base).unwrap().flags.writable());
        assert!(ctx.query(base + PAGE).unwrap().flags.read_only());
        assert!(ctx.query(base + 2 * PAGE).unwrap().flags.read_only());
        assert!(ctx.query(base + 3 * PAGE).unwrap().flags.writable());

        // Writes to the ends still succeed; writes into the
        // window are denied.
        ctx.write_bytes(base, &[7]).unwrap();
        ctx.write_bytes(base + 3 * PAGE, &[8]).unwrap();
        assert_eq!(
            ctx.write_bytes(base + PAGE, &[9]),
            Err(Error::AccessDenied)
        );

        // Reads of the read-only window still work.
        let mut byte = [0u8; 1];
        ctx.read_bytes(base + PAGE, &mut byte).unwrap();
        assert_eq!(byte[0], 1);
    }

    #[test]
    fn test_protect_same_as_before() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();

        // SAME_AS_BEFORE with no bits and no pageability
        // change is a no-op.
        ctx.protect(base, PAGE, ProtFlags::SAME_AS_BEFORE, None).unwrap();
        assert!(!ctx.range_at(base).unwrap().prot.ro);

        // Adding a single bit keeps the others.
        ctx.protect(
            base,
            PAGE,
            ProtFlags::SAME_AS_BEFORE | ProtFlags::READ_ONLY,
            None,
        )
        .unwrap();
        let range = ctx.range_at(base).unwrap();
        assert!(range.prot.ro);
        assert!(!range.prot.executable);

        // A full replacement resets what is not named.
        ctx.protect(base, PAGE, ProtFlags::EXECUTABLE, None).unwrap();
        let range = ctx.range_at(base).unwrap();
        assert!(!range.prot.ro);
        assert!(range.prot.executable);
    }

    #[test]
    fn test_accounting_round_trip() {
        let (_mem, ctx) = new_context(ContextKind::User, 256);
        let clean = ctx.stats();
        assert_eq!(clean, MemoryStats::default());

        // Pageable, wired, reserved and guarded allocations
        // all round-trip the accounting.
        let a = ctx
            .allocate(None, 3 * PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();
        let b = ctx
            .allocate(None, 2 * PAGE, ProtFlags::empty(), AllocFlags::NON_PAGED, None)
            .unwrap();
        let c = ctx
            .allocate(None, 4 * PAGE, ProtFlags::empty(), AllocFlags::RESERVE, None)
            .unwrap();
        let d = ctx
            .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::GUARD_PAGE, None)
            .unwrap();

        let stats = ctx.stats();
        assert_eq!(stats.pageable, 3 * PAGE + PAGE);
        assert_eq!(stats.non_paged, 2 * PAGE);
        assert_eq!(stats.reserved, 4 * PAGE);
        assert_eq!(stats.committed, 3 * PAGE + 2 * PAGE + PAGE);

        ctx.free(a, 3 * PAGE).unwrap();
        ctx.free(b, 2 * PAGE).unwrap();
        ctx.free(c, 4 * PAGE).unwrap();
        ctx.free(d, PAGE).unwrap();

        assert_eq!(ctx.stats(), clean);
        assert_eq!(ctx.range_count(), 0);
    }

    #[test]
    fn test_commit_over_reservation() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, 4 * PAGE, ProtFlags::empty(), AllocFlags::RESERVE, None)
            .unwrap();

        // A reservation installs nothing and cannot be
        // touched.
        assert!(ctx.query(base).is_none());
        assert_eq!(
            ctx.read_bytes(base, &mut [0u8; 1]),
            Err(Error::AccessDenied)
        );

        // Committing one page makes just that page usable.
        let got = ctx
            .allocate(
                Some(base + PAGE),
                PAGE,
                ProtFlags::empty(),
                AllocFlags::empty(),
                None,
            )
            .unwrap();
        assert_eq!(got, base + PAGE);
        ctx.write_bytes(base + PAGE, &[3]).unwrap();
        assert_eq!(
            ctx.read_bytes(base, &mut [0u8; 1]),
            Err(Error::AccessDenied)
        );

        // Committing the same page again collides; this is
        // how page-by-page commit callers detect live pages.
        assert_eq!(
            ctx.allocate(
                Some(base + PAGE),
                PAGE,
                ProtFlags::empty(),
                AllocFlags::empty(),
                None,
            ),
            Err(Error::InUse)
        );

        // The range is still one range, partially committed.
        assert_eq!(ctx.range_count(), 1);
        let range = ctx.range_at(base).unwrap();
        assert!(range.reserved);
        assert_eq!(range.size_committed, PAGE);

        // Freeing the whole reservation, committed part and
        // all, zeroes the accounting.
        ctx.free(base, 4 * PAGE).unwrap();
        assert_eq!(ctx.stats(), MemoryStats::default());
    }

    #[test]
    fn test_out_of_memory_rolls_back() {
        // An arena too small for the request: the attempt
        // must fail cleanly and leave no trace.
        let (_mem, ctx) = new_context(ContextKind::User, 8);
        let clean = ctx.stats();

        let result = ctx.allocate(
            None,
            32 * PAGE,
            ProtFlags::empty(),
            AllocFlags::NON_PAGED,
            None,
        );
        assert_eq!(result, Err(Error::NotEnoughMemory));
        assert_eq!(ctx.stats(), clean);
        assert_eq!(ctx.range_count(), 0);
    }

    #[test]
    fn test_phys32_placement() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(
                None,
                2 * PAGE,
                ProtFlags::empty(),
                AllocFlags::NON_PAGED | AllocFlags::PHYS32,
                None,
            )
            .unwrap();

        for i in 0..2 {
            let info = ctx.query(base + i * PAGE).unwrap();
            assert!(info.frame.end_address().as_usize() < 1 << 32);
        }
        assert!(ctx.range_at(base).unwrap().phys32);
    }

    #[test]
    fn test_kernel_context_span() {
        let (_mem, ctx) = new_context(ContextKind::Kernel, 128);
        let base = ctx
            .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert!(KERNEL_DYNAMIC.contains_addr(base));
    }

    #[test]
    fn test_concurrent_allocate_free() {
        let (_mem, ctx) = new_context(ContextKind::User, 512);

        let mut handles = std::vec::Vec::new();
        for t in 0..4_usize {
            let ctx = ctx.clone();
            handles.push(std::thread::spawn(move || {
                // Each thread churns its own fixed window, so
                // collisions are real but bounded.
                let base = VirtAddr::new(0x4000_0000 + t * 0x10_0000);
                for _ in 0..200 {
                    let got = ctx
                        .allocate(
                            Some(base),
                            2 * PAGE,
                            ProtFlags::empty(),
                            AllocFlags::empty(),
                            None,
                        )
                        .unwrap();
                    ctx.write_bytes(got, &[t as u8]).unwrap();
                    ctx.free(got, 2 * PAGE).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        ctx.check_ranges();
        assert_eq!(ctx.range_count(), 0);
        assert_eq!(ctx.stats(), MemoryStats::default());
    }

    #[test]
    fn test_dropping_context_releases_frames() {
        let mem = EmulatedMemory::new(128);
        let registry = Arc::new(mem.registry());
        let anon_addr = registry.anon_frame().start_address();

        let frame = {
            let ctx = Context::new(ContextKind::User, registry.clone()).unwrap();
            let base = ctx
                .allocate(None, PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
                .unwrap();
            ctx.write_bytes(base, &[1]).unwrap();
            ctx.query(base).unwrap().frame
        };

        // The context is gone; its private frame was freed
        // and the zero frame is back to its pin.
        assert_eq!(registry.refcount(frame.start_address()), None);
        assert_eq!(registry.refcount(anon_addr), Some(1));
    }

    #[test]
    fn test_resolve_denies_after_failed_fault() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, PAGE, ProtFlags::READ_ONLY, AllocFlags::empty(), None)
            .unwrap();

        // A read of read-only memory works; a write does not.
        ctx.read_bytes(base, &mut [0u8; 1]).unwrap();
        assert_eq!(ctx.write_bytes(base, &[1]), Err(Error::AccessDenied));
        assert_eq!(ctx.fault(base, AccessKind::Write), Err(Error::AccessDenied));
    }

    #[test]
    fn test_free_from_guarded_base_releases_guard() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let clean = ctx.stats();
        let base = ctx
            .allocate(
                None,
                2 * PAGE,
                ProtFlags::empty(),
                AllocFlags::GUARD_PAGE,
                None,
            )
            .unwrap();

        // Freeing the span we were given releases the hidden
        // guard page too.
        ctx.free(base, 2 * PAGE).unwrap();
        assert_eq!(ctx.range_count(), 0);
        assert_eq!(ctx.stats(), clean);
        assert!(ctx.query(base - PAGE).is_none());
    }

    #[test]
    fn test_working_set_drops_when_wired() {
        let (_mem, ctx) = new_context(ContextKind::User, 128);
        let base = ctx
            .allocate(None, 2 * PAGE, ProtFlags::empty(), AllocFlags::empty(), None)
            .unwrap();

        let mut buf = [0u8; 2 * PAGE];
        ctx.read_bytes(base, &mut buf).unwrap();
        assert_eq!(ctx.range_at(base).unwrap().working_set.len(), 2);

        // Wiring the range down empties its working set; the
        // pages are no longer replacement candidates.
        ctx.protect(base, 2 * PAGE, ProtFlags::SAME_AS_BEFORE, Some(false))
            .unwrap();
        let range = ctx.range_at(base).unwrap();
        assert!(!range.pageable);
        assert!(range.working_set.is_empty());

        let stats = ctx.stats();
        assert_eq!(stats.pageable, 0);
        assert_eq!(stats.non_paged, 2 * PAGE);

        ctx.free(base, 2 * PAGE).unwrap();
        assert_eq!(ctx.stats(), MemoryStats::default());
    }
}
