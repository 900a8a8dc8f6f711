// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The page fault handler.
//!
//! Faults are resolved against the faulting context's range tree:
//!
//! - A touched demand-zero page is promoted to a read-only mapping
//!   of the shared zero frame, or peeled into a private zeroed
//!   frame on write.
//! - A file-backed page is fetched from the page cache and shared,
//!   read-only at first. The first write to a shared file page
//!   records a dirty region and makes the entry writable; the
//!   first write to a private file page peels a private copy.
//! - A write to any copy-on-write page that is still read-only
//!   peels it.
//!
//! Anything else is a real access violation, reported to the
//! caller as [`Error::AccessDenied`].
//!
//! Cache operations may sleep, so the handler drops the context
//! spinlock around them and revalidates the range afterwards.

use crate::backing::FaultType;
use crate::context::Context;
use crate::range::{CowMode, MappedFile};
use crate::Error;
use core::ptr;
use locks::lock;
use memory::{
    phys_to_virt_addr_at, PageProtection, PageTableFlags, PhysFrame, VirtAddr, VirtPage,
};
use physmem::AllocateOptions;

/// The kind of memory access that faulted.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessKind {
    /// A data read.
    Read,

    /// A data write.
    Write,

    /// An instruction fetch.
    Execute,
}

/// What the locked classification decided to do about a fault.
///
enum Action {
    /// The fault was resolved (or was spurious) under the
    /// lock.
    Done(FaultType),

    /// A file page must be fetched from the cache and
    /// installed.
    FilePageIn {
        page: VirtPage,
        mapped: MappedFile,
        prot: PageProtection,
        cow: CowMode,
        phys32: bool,
    },

    /// A present, read-only shared file page was written:
    /// record the dirty region and make the entry writable.
    SharedDirty {
        page: VirtPage,
        mapped: MappedFile,
        prot: PageProtection,
    },
}

impl Context {
    /// Resolves a page fault at `addr` for the given kind of
    /// access.
    ///
    /// On success, the access that faulted can be retried and
    /// will make progress. Returns whether the resolution was
    /// soft (satisfied from memory) or hard (read from a
    /// device). Real access violations fail with
    /// [`Error::AccessDenied`].
    ///
    pub fn fault(&self, addr: VirtAddr, access: AccessKind) -> Result<FaultType, Error> {
        let action = {
            let mut inner = lock!(self.inner);
            self.classify(&mut inner, addr, access)?
        };

        match action {
            Action::Done(fault_type) => Ok(fault_type),
            Action::FilePageIn {
                page,
                mapped,
                prot,
                cow,
                phys32,
            } => self.file_page_in(page, mapped, prot, cow, phys32, access),
            Action::SharedDirty { page, mapped, prot } => self.shared_dirty(page, mapped, prot),
        }
    }

    /// Classifies a fault under the context lock, resolving it
    /// in place when no cache work is needed.
    ///
    fn classify(
        &self,
        inner: &mut crate::context::ContextInner,
        addr: VirtAddr,
        access: AccessKind,
    ) -> Result<Action, Error> {
        let range = match inner.ranges.find_containing_mut(addr) {
            Some(range) => range,
            None => return Err(Error::AccessDenied),
        };

        let page_size = range.page_size();
        let pg = page_size.bytes();

        // The guard page is permanently non-present.
        if range.has_guard_page && addr.as_usize() < range.virt.as_usize() + pg {
            return Err(Error::AccessDenied);
        }
        if access == AccessKind::Execute && !range.prot.executable {
            return Err(Error::AccessDenied);
        }

        let page = VirtPage::containing_address(addr, page_size);
        let mut pt = unsafe { self.page_table() };
        let info = pt.query(page.start_address());

        // An uncommitted reservation has nothing to fault in.
        if range.reserved && info.is_none() {
            return Err(Error::AccessDenied);
        }

        let info = match info {
            Some(info) => info,
            None => {
                if let Some(mapped) = &range.mapped {
                    // A lazily mapped file page.
                    return Ok(Action::FilePageIn {
                        page,
                        mapped: mapped.clone(),
                        prot: range.prot,
                        cow: range.cow,
                        phys32: range.phys32,
                    });
                }

                // Anonymous ranges always park their backing,
                // so an empty entry is a stale access.
                return Err(Error::AccessDenied);
            }
        };

        if !info.flags.present() {
            // A parked entry: demand-zero memory before its
            // first touch. Swapped-out pages would also land
            // here; there is no swap reader yet.
            if info.protection().is_swap_phys {
                return Err(Error::AccessDenied);
            }

            match access {
                AccessKind::Read | AccessKind::Execute => {
                    // Share the zero frame, read-only.
                    let flags = (range.prot.table_flags() | PageTableFlags::PRESENT)
                        & !PageTableFlags::WRITABLE;
                    let mut allocator = &*self.registry;
                    let (_, change) =
                        unsafe { pt.set_page(page, info.frame, flags, &mut allocator) }
                            .map_err(|_| Error::NotEnoughMemory)?;
                    change.flush_if(false);
                }
                AccessKind::Write => {
                    if range.prot.ro {
                        return Err(Error::AccessDenied);
                    }

                    // Peel a private zeroed frame; the parked
                    // reference on the zero frame is dropped.
                    let mut options = AllocateOptions::new();
                    options.phys32 = range.phys32;
                    options.zero = true;
                    let fresh = self
                        .registry
                        .allocate(options)
                        .ok_or(Error::NotEnoughMemory)?;

                    let flags = range.prot.table_flags() | PageTableFlags::PRESENT;
                    let mut allocator = &*self.registry;
                    let (previous, change) =
                        match unsafe { pt.set_page(page, fresh, flags, &mut allocator) } {
                            Ok(done) => done,
                            Err(_) => {
                                self.registry.deref_frame(fresh.start_address());
                                return Err(Error::NotEnoughMemory);
                            }
                        };
                    change.flush_if(false);

                    if let Some(previous) = previous {
                        self.registry.deref_frame(previous.start_address());
                    }
                }
            }

            if range.pageable && !range.working_set.contains(&page) {
                range.working_set.push(page);
            }

            return Ok(Action::Done(FaultType::Soft));
        }

        // The entry is present; only a write to a read-only
        // page needs work.
        if access == AccessKind::Write && info.flags.read_only() {
            if range.prot.ro {
                return Err(Error::AccessDenied);
            }

            match range.cow {
                CowMode::Asymmetric | CowMode::Symmetric => {
                    // Peel: copy the shared frame into a
                    // private one and drop the shared
                    // reference.
                    let mut options = AllocateOptions::new();
                    options.phys32 = range.phys32;
                    let fresh = self
                        .registry
                        .allocate(options)
                        .ok_or(Error::NotEnoughMemory)?;

                    unsafe {
                        self.copy_frame(info.frame, fresh);
                    }

                    let flags = range.prot.table_flags() | PageTableFlags::PRESENT;
                    let mut allocator = &*self.registry;
                    let (previous, change) =
                        match unsafe { pt.set_page(page, fresh, flags, &mut allocator) } {
                            Ok(done) => done,
                            Err(_) => {
                                self.registry.deref_frame(fresh.start_address());
                                return Err(Error::NotEnoughMemory);
                            }
                        };
                    change.flush_if(true);

                    if let Some(previous) = previous {
                        self.registry.deref_frame(previous.start_address());
                    }

                    if range.pageable && !range.working_set.contains(&page) {
                        range.working_set.push(page);
                    }

                    return Ok(Action::Done(FaultType::Soft));
                }
                CowMode::None => {
                    if let Some(mapped) = &range.mapped {
                        // A shared file page's first write.
                        return Ok(Action::SharedDirty {
                            page,
                            mapped: mapped.clone(),
                            prot: range.prot,
                        });
                    }

                    return Err(Error::AccessDenied);
                }
            }
        }

        if access == AccessKind::Execute && info.flags.no_execute() {
            return Err(Error::AccessDenied);
        }

        // Present and adequate: the fault was spurious, such
        // as a stale TLB entry on another CPU.
        Ok(Action::Done(FaultType::Soft))
    }

    /// Fetches a file page from the cache and installs it,
    /// having dropped the context lock for the cache work.
    ///
    fn file_page_in(
        &self,
        page: VirtPage,
        mapped: MappedFile,
        prot: PageProtection,
        cow: CowMode,
        phys32: bool,
        access: AccessKind,
    ) -> Result<FaultType, Error> {
        let fileoff = mapped.file_offset(page.start_address());
        let write = access == AccessKind::Write;
        if write && prot.ro {
            return Err(Error::AccessDenied);
        }

        // Populate the cache page. This may read from the
        // device.
        let (frame, fault_type) = mapped.backing.frame_at(fileoff)?;

        // A write to a shared mapping dirties the file window
        // covered by the page.
        if write && cow == CowMode::None {
            let len = core::cmp::min(
                page.size().bytes(),
                mapped.backing.file_size().saturating_sub(fileoff),
            );
            mapped.backing.mark_dirty(fileoff, len);
        }

        let mut inner = lock!(self.inner);

        // The range may have been freed or replaced while the
        // lock was down.
        let range = match inner.ranges.find_containing_mut(page.start_address()) {
            Some(range) => range,
            None => return Err(Error::AccessDenied),
        };
        let still_same = match &range.mapped {
            Some(current) => current.region == mapped.region || current.base == mapped.base,
            None => false,
        };
        if !still_same || range.reserved {
            return Err(Error::AccessDenied);
        }

        let mut pt = unsafe { self.page_table() };
        if let Some(info) = pt.query(page.start_address()) {
            if info.flags.present() {
                // Another CPU resolved it first.
                return Ok(FaultType::Soft);
            }
        }

        let mut allocator = &*self.registry;
        if write && cow == CowMode::Symmetric {
            // A private mapping's first touch is a write:
            // skip the shared step and install a copy.
            let mut options = AllocateOptions::new();
            options.phys32 = phys32;
            let fresh = self
                .registry
                .allocate(options)
                .ok_or(Error::NotEnoughMemory)?;

            unsafe {
                self.copy_frame(frame, fresh);
            }

            let flags = prot.table_flags() | PageTableFlags::PRESENT;
            let (previous, change) =
                match unsafe { pt.set_page(page, fresh, flags, &mut allocator) } {
                    Ok(done) => done,
                    Err(_) => {
                        self.registry.deref_frame(fresh.start_address());
                        return Err(Error::NotEnoughMemory);
                    }
                };
            change.flush_if(false);
            debug_assert!(previous.is_none());
        } else {
            // Install the cache's frame. Reads share it
            // read-only; a shared write takes it writable,
            // with the dirty region already recorded.
            let mut flags = prot.table_flags() | PageTableFlags::PRESENT;
            if !(write && cow == CowMode::None) {
                flags &= !PageTableFlags::WRITABLE;
            }

            let (previous, change) =
                unsafe { pt.set_page(page, frame, flags, &mut allocator) }
                    .map_err(|_| Error::NotEnoughMemory)?;
            change.flush_if(false);
            debug_assert!(previous.is_none());

            self.registry.ref_frame(frame.start_address());
        }

        if range.pageable && !range.working_set.contains(&page) {
            range.working_set.push(page);
        }

        Ok(fault_type)
    }

    /// Records a dirty region for a written shared file page
    /// and makes its entry writable.
    ///
    fn shared_dirty(
        &self,
        page: VirtPage,
        mapped: MappedFile,
        prot: PageProtection,
    ) -> Result<FaultType, Error> {
        let fileoff = mapped.file_offset(page.start_address());
        let len = core::cmp::min(
            page.size().bytes(),
            mapped.backing.file_size().saturating_sub(fileoff),
        );
        mapped.backing.mark_dirty(fileoff, len);

        let inner = lock!(self.inner);
        let range = match inner.ranges.find_containing(page.start_address()) {
            Some(range) => range,
            None => return Err(Error::AccessDenied),
        };
        if range.mapped.is_none() || range.prot.ro {
            return Err(Error::AccessDenied);
        }

        let mut pt = unsafe { self.page_table() };
        let flags = prot.table_flags() | PageTableFlags::PRESENT;
        match unsafe { pt.change_flags(page, flags) } {
            Ok(change) => change.flush_if(true),
            // The entry went away while the lock was down;
            // the retried access will fault again.
            Err(_) => return Ok(FaultType::Soft),
        }

        Ok(FaultType::Soft)
    }

    /// Copies the contents of one frame into another through
    /// the physical memory mapping.
    ///
    unsafe fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        let offset = self.registry.physmem_offset();
        let src_virt = phys_to_virt_addr_at(src.start_address(), offset);
        let dst_virt = phys_to_virt_addr_at(dst.start_address(), offset);
        ptr::copy_nonoverlapping(
            src_virt.as_usize() as *const u8,
            dst_virt.as_usize() as *mut u8,
            core::cmp::min(src.size().bytes(), dst.size().bytes()),
        );
    }
}
