// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains constants describing the virtual memory layout.
//!
//! This module contains various constants describing [regions of virtual memory](crate::VirtAddrRange)
//! that are used for a prescribed purpose:
//!
//! - [`NULL_PAGE`]: The first virtual page, which is reserved to ensure null pointer dereferences cause a page fault.
//! - [`USERSPACE`]: The first half of virtual memory, which is used by userspace processes.
//! - [`LOW_32BIT`]: The window handed out to allocations that must stay below 4 GiB.
//! - [`KERNEL_BINARY`]: The kernel binary is mapped within this range.
//! - [`BOOT_INFO`]: The boot info provided by the bootloader is stored here.
//! - [`KERNEL_HEAP`]: The region used for the kernel's heap.
//! - [`KERNEL_STACK`]: The region used for all kernel stacks.
//! - [`PHYSICAL_MEMORY`]: The region into which all physical memory is mapped.
//! - [`KERNEL_DYNAMIC`]: The region from which the kernel's own address space context allocates, including the page cache's file spans.
//!
//! There is also the address constant [`PHYSICAL_MEMORY_OFFSET`]: the
//! offset at which all physical memory is mapped.
//!
//! The memory layout is summarised below:
//!
//! | Region              |           Start address |            Last address |      Size |
//! | ------------------- | ----------------------: | ----------------------: | --------: |
//! | [`NULL_PAGE`]       |                   `0x0` |             `0x1f_ffff` |     2 MiB |
//! | [`USERSPACE`]       |             `0x20_0000` |      `0x7fff_ffff_ffff` | < 128 TiB |
//! | [`KERNEL_BINARY`]   | `0xffff_8000_0000_0000` | `0xffff_8000_3fff_ffff` |     1 GiB |
//! | [`BOOT_INFO`]       | `0xffff_8000_4000_0000` | `0xffff_8000_4000_0fff` |     4 KiB |
//! | [`KERNEL_HEAP`]     | `0xffff_8000_4444_0000` | `0xffff_8000_444b_ffff` |   512 KiB |
//! | [`KERNEL_STACK`]    | `0xffff_8000_5555_0000` | `0xffff_8000_5d5c_ffff` | 128.5 MiB |
//! | [`PHYSICAL_MEMORY`] | `0xffff_8000_8000_0000` | `0xffff_bfff_ffff_ffff` |  < 64 TiB |
//! | [`KERNEL_DYNAMIC`]  | `0xffff_c000_0000_0000` | `0xffff_efff_ffff_ffff` |    48 TiB |

use crate::{VirtAddr, VirtAddrRange};

/// The first virtual page, which is reserved to ensure null pointer dereferences cause a page fault.
///
pub const NULL_PAGE: VirtAddrRange = VirtAddrRange::new(NULL_PAGE_START, NULL_PAGE_END);
const NULL_PAGE_START: VirtAddr = VirtAddr::zero();
const NULL_PAGE_END: VirtAddr = VirtAddr::new(0x1f_ffff_usize);

/// The first half of virtual memory, which is used by userspace processes.
///
pub const USERSPACE: VirtAddrRange = VirtAddrRange::new(USERSPACE_START, USERSPACE_END);
const USERSPACE_START: VirtAddr = VirtAddr::new(0x20_0000_usize);
const USERSPACE_END: VirtAddr = VirtAddr::new(0x7fff_ffff_ffff_usize);

/// The window handed out to allocations that must stay below 4 GiB,
/// for callers that will truncate addresses to 32 bits.
///
/// The window excludes the 4 GiB boundary itself, so a page-aligned
/// allocation within the window never touches it.
///
pub const LOW_32BIT: VirtAddrRange = VirtAddrRange::new(LOW_32BIT_START, LOW_32BIT_END);
const LOW_32BIT_START: VirtAddr = VirtAddr::new(0x1000_usize);
const LOW_32BIT_END: VirtAddr = VirtAddr::new(0xffff_efff_usize);

/// The higher half of virtual memory, which is used by the kernel.
///
pub const KERNELSPACE: VirtAddrRange = VirtAddrRange::new(KERNELSPACE_START, KERNELSPACE_END);
const KERNELSPACE_START: VirtAddr = VirtAddr::new(0xffff_8000_0000_0000_usize);
const KERNELSPACE_END: VirtAddr = VirtAddr::new(0xffff_ffff_ffff_ffff_usize);

/// The kernel binary is mapped within this range.
///
pub const KERNEL_BINARY: VirtAddrRange = VirtAddrRange::new(KERNEL_BINARY_START, KERNEL_BINARY_END);
const KERNEL_BINARY_START: VirtAddr = VirtAddr::new(0xffff_8000_0000_0000_usize);
const KERNEL_BINARY_END: VirtAddr = VirtAddr::new(0xffff_8000_3fff_ffff_usize);

/// The boot info provided by the bootloader is stored here.
///
pub const BOOT_INFO: VirtAddrRange = VirtAddrRange::new(BOOT_INFO_START, BOOT_INFO_END);
const BOOT_INFO_START: VirtAddr = VirtAddr::new(0xffff_8000_4000_0000_usize);
const BOOT_INFO_END: VirtAddr = VirtAddr::new(0xffff_8000_4000_0fff_usize);

/// The region used for the kernel's heap.
///
pub const KERNEL_HEAP: VirtAddrRange = VirtAddrRange::new(KERNEL_HEAP_START, KERNEL_HEAP_END);
const KERNEL_HEAP_START: VirtAddr = VirtAddr::new(0xffff_8000_4444_0000_usize);
const KERNEL_HEAP_END: VirtAddr = VirtAddr::new(0xffff_8000_444b_ffff_usize);

/// The region used for all kernel stacks.
///
/// Note that even though the stack counts downwards, we use the smaller address as
/// the start address and the larger address as the end address.
///
pub const KERNEL_STACK: VirtAddrRange = VirtAddrRange::new(KERNEL_STACK_START, KERNEL_STACK_END);
const KERNEL_STACK_START: VirtAddr = VirtAddr::new(0xffff_8000_5555_0000_usize);
const KERNEL_STACK_END: VirtAddr = VirtAddr::new(0xffff_8000_5d5c_ffff_usize);

/// The region into which all physical memory is mapped.
///
pub const PHYSICAL_MEMORY: VirtAddrRange =
    VirtAddrRange::new(PHYSICAL_MEMORY_OFFSET, PHYSICAL_MEMORY_END);
/// The offset at which all physical memory is mapped.
///
/// For any valid physical address, that address can be reached at
/// the same virtual address, plus `PHYSICAL_MEMORY_OFFSET`.
///
pub const PHYSICAL_MEMORY_OFFSET: VirtAddr = VirtAddr::new(0xffff_8000_8000_0000_usize);
const PHYSICAL_MEMORY_END: VirtAddr = VirtAddr::new(0xffff_bfff_ffff_ffff_usize);

/// The region from which the kernel's own address space context
/// allocates, including the page cache's file spans.
///
pub const KERNEL_DYNAMIC: VirtAddrRange =
    VirtAddrRange::new(KERNEL_DYNAMIC_START, KERNEL_DYNAMIC_END);
const KERNEL_DYNAMIC_START: VirtAddr = VirtAddr::new(0xffff_c000_0000_0000_usize);
const KERNEL_DYNAMIC_END: VirtAddr = VirtAddr::new(0xffff_efff_ffff_ffff_usize);
