// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the filesystem's logical layer: vnodes, file
//! handles, and the page cache.
//!
//! This crate does not implement a specific on-disk filesystem.
//! It provides the [`Vnode`] abstraction that filesystem drivers
//! produce, the [`File`] handles the rest of the kernel consumes,
//! and the [`PageCache`] that holds each file's bytes in memory.
//!
//! The page cache is the bridge between files and the virtual
//! memory manager: it keeps a lazily committed span of the kernel
//! address space sized to the file, populates its pages from the
//! owning block device on demand, tracks the regions dirtied
//! through shared mappings, and writes them back on flush. Each
//! [`Vnode`] implements [`virtmem::FileBacking`] over its cache,
//! which is what lets [`virtmem::Context::allocate`] map files.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod file;
mod pagecache;
mod vnode;

pub use file::File;
pub use pagecache::{DirtyRegion, PageCache};
pub use vnode::{Vnode, VnodeKind};

use bitflags::bitflags;

bitflags! {
    /// Describes the actions that can be taken on a
    /// file or folder.
    ///
    pub struct Permissions: u8 {
        /// No actions can be performed on a file with
        /// no permission bits set.
        ///
        const NONE = 0;

        /// A file with this bit set can be executed
        /// to start a new process.
        ///
        const EXECUTE = 1 << 0;

        /// A file with this bit set can be modified,
        /// such as to truncate its length or overwrite
        /// its contents.
        ///
        const WRITE = 1 << 1;

        /// A file with this bit set can be read.
        ///
        const READ = 1 << 2;
    }
}
