// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use align::{align_down_usize, align_up_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// The largest valid physical memory address.
///
/// Physical addresses are at most 52 bits wide.
///
const MAX_PHYS_ADDR: usize = 0x000f_ffff_ffff_ffff;

/// A physical memory address.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(usize);

/// An invalid physical memory address.
///
/// If an attempt is made to create a `PhysAddr` from a
/// value larger than [`MAX_PHYS_ADDR`], or to use an
/// unaligned address where an aligned address is needed,
/// then `InvalidPhysAddr` is returned, containing the
/// attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InvalidPhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical memory address.
    ///
    /// # Panics
    ///
    /// `new` will panic if `addr` exceeds the 52-bit
    /// physical address space.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to PhysAddr::new"),
        }
    }

    /// Tries to create a new physical memory address.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidPhysAddr> {
        if addr <= MAX_PHYS_ADDR {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    // Translation to platform-specific types.

    /// Returns the address as a [`x86_64::PhysAddr`],
    /// for convenience.
    ///
    #[inline]
    #[must_use]
    pub fn as_x86_64(&self) -> x86_64::PhysAddr {
        x86_64::PhysAddr::new(self.0 as u64)
    }

    // Special handling for the zero address.

    /// Returns the zero physical memory address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns whether this is the zero address.
    ///
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    // Alignment.

    /// Aligns the physical address downwards
    /// to the largest exact multiple of `align`
    /// that is no larger than the address.
    ///
    /// `align` must be an exact multiple of
    /// two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        PhysAddr(align_down_usize(self.0, align))
    }

    /// Aligns the physical address upwards to
    /// the smallest exact multiple of `align`
    /// that is no smaller than the address.
    ///
    /// `align` must be an exact multiple of
    /// two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        PhysAddr(align_up_usize(self.0, align))
    }

    /// Checks whether the physical address has
    /// the given alignment.
    ///
    /// `align` must be an exact multiple of
    /// two.
    ///
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.align_down(align).0 == self.0
    }

    // Overflow-safe mathematical operations.

    /// Checked integer addition. Computes `self + rhs`,
    /// returning `None` if the result is not a valid
    /// physical address.
    ///
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        if let Some(sum) = self.0.checked_add(rhs) {
            if let Ok(addr) = PhysAddr::try_new(sum) {
                Some(addr)
            } else {
                None
            }
        } else {
            None
        }
    }
}

// Formatting.

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:p}", self.0 as *const ()))
            .finish()
    }
}

impl fmt::LowerHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Pointer for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&(self.0 as *const ()), f)
    }
}

impl fmt::UpperHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

// Mathematical operators.

impl Add<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr::new(self.0 + rhs)
    }
}

impl AddAssign<usize> for PhysAddr {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: usize) -> Self::Output {
        PhysAddr::new(self.0 - rhs)
    }
}

impl SubAssign<usize> for PhysAddr {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0.checked_sub(rhs.0).unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_bounds() {
        assert_eq!(PhysAddr::try_new(0), Ok(PhysAddr(0)));
        assert_eq!(PhysAddr::try_new(MAX_PHYS_ADDR), Ok(PhysAddr(MAX_PHYS_ADDR)));
        assert_eq!(
            PhysAddr::try_new(MAX_PHYS_ADDR + 1),
            Err(InvalidPhysAddr(MAX_PHYS_ADDR + 1))
        );
    }

    #[test]
    fn test_alignment() {
        let addr = PhysAddr::new(0x1234_5678_usize);
        assert_eq!(addr.align_down(0x1000), PhysAddr::new(0x1234_5000_usize));
        assert_eq!(addr.align_up(0x1000), PhysAddr::new(0x1234_6000_usize));
        assert!(!addr.is_aligned(0x1000));
        assert!(addr.align_down(0x1000).is_aligned(0x1000));
    }
}
