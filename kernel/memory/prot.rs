// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::PageTableFlags;

/// The portable protection record for a page of virtual memory.
///
/// This is the shape the rest of the kernel speaks; the page table
/// translates it into architecture bits and back. `rw` and `ro` are
/// both stored, even though one is derivable from the other, so
/// that ranges can be split and merged without re-deriving either.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageProtection {
    /// The page is mapped and usable.
    pub present: bool,

    /// The page may be written.
    pub rw: bool,

    /// The page may be executed.
    pub executable: bool,

    /// The page is accessible from ring 3.
    pub user: bool,

    /// The page may not be written.
    pub ro: bool,

    /// Accesses to the page bypass the cache.
    pub uncached: bool,

    /// The page uses the huge page granularity.
    pub huge_page: bool,

    /// The recorded frame address is in swap space,
    /// not physical memory.
    pub is_swap_phys: bool,
}

impl PageProtection {
    /// Returns a protection record with no bits set.
    ///
    pub const fn empty() -> Self {
        PageProtection {
            present: false,
            rw: false,
            executable: false,
            user: false,
            ro: false,
            uncached: false,
            huge_page: false,
            is_swap_phys: false,
        }
    }

    /// Returns the architecture page table flags expressing
    /// this protection.
    ///
    pub fn table_flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::empty();
        if self.present {
            flags |= PageTableFlags::PRESENT;
        }
        if self.rw && !self.ro {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.uncached {
            flags |= PageTableFlags::NO_CACHE;
        }
        if self.huge_page {
            flags |= PageTableFlags::HUGE_PAGE;
        }
        if !self.executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if self.is_swap_phys {
            flags |= PageTableFlags::SWAP;
        }

        flags
    }

    /// Returns the protection expressed by the given
    /// architecture page table flags.
    ///
    pub fn from_table_flags(flags: PageTableFlags) -> Self {
        PageProtection {
            present: flags.present(),
            rw: flags.writable(),
            executable: flags.executable(),
            user: flags.contains(PageTableFlags::USER_ACCESSIBLE),
            ro: flags.read_only(),
            uncached: flags.contains(PageTableFlags::NO_CACHE),
            huge_page: flags.huge(),
            is_swap_phys: flags.contains(PageTableFlags::SWAP),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_translation() {
        // The empty protection still carries NO_EXECUTE:
        // a page that cannot be executed is the default.
        let none = PageProtection::empty();
        assert_eq!(none.table_flags(), PageTableFlags::NO_EXECUTE);

        let mut prot = PageProtection::empty();
        prot.present = true;
        prot.rw = true;
        prot.user = true;
        let flags = prot.table_flags();
        assert!(flags.present());
        assert!(flags.writable());
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(flags.no_execute());

        // Read-only wins over read-write: both bits are
        // stored and `ro` vetoes the writable flag.
        prot.ro = true;
        assert!(!prot.table_flags().writable());

        // A round trip preserves the effective protection.
        let mut prot = PageProtection::empty();
        prot.present = true;
        prot.executable = true;
        prot.uncached = true;
        let back = PageProtection::from_table_flags(prot.table_flags());
        assert!(back.present);
        assert!(back.executable);
        assert!(back.uncached);
        assert!(!back.rw && back.ro);
    }
}
