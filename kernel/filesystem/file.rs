// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! File handles: a vnode plus an offset and the capabilities the
//! handle was opened with.

use crate::vnode::{Vnode, VnodeKind};
use crate::Permissions;
use alloc::sync::Arc;
use virtmem::{Error, FileBacking, FileView};

/// An open file: a vnode, a byte offset, and the capabilities
/// the opener asked for.
///
/// The capabilities granted are the intersection of what was
/// asked for and what the vnode permits.
///
pub struct File {
    vnode: Option<Arc<Vnode>>,
    offset: usize,
    read: bool,
    write: bool,
}

impl File {
    /// Opens a handle on the given vnode.
    ///
    pub fn open(vnode: Arc<Vnode>, read: bool, write: bool) -> File {
        let read = read && vnode.permissions().contains(Permissions::READ);
        let write = write && vnode.permissions().contains(Permissions::WRITE);
        File {
            vnode: Some(vnode),
            read,
            write,
            offset: 0,
        }
    }

    /// Returns a handle with no vnode behind it, as a freshly
    /// created descriptor has before it is bound.
    ///
    pub fn unbound() -> File {
        File {
            vnode: None,
            read: false,
            write: false,
            offset: 0,
        }
    }

    /// Returns the handle's vnode, if it is bound.
    ///
    pub fn vnode(&self) -> Option<&Arc<Vnode>> {
        self.vnode.as_ref()
    }

    /// Returns the handle's byte offset.
    ///
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Moves the handle's byte offset.
    ///
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Returns whether the handle can read.
    ///
    pub fn can_read(&self) -> bool {
        self.read
    }

    /// Returns whether the handle can write.
    ///
    pub fn can_write(&self) -> bool {
        self.write
    }

    /// Produces the view of this handle that
    /// [`virtmem::Context::allocate`] consumes for file
    /// mappings.
    ///
    /// Fails with [`Error::Uninitialized`] if the handle has
    /// no vnode, and [`Error::InvalidArgument`] if the vnode's
    /// kind cannot be memory mapped. Only regular files and
    /// block devices can.
    ///
    pub fn map_view(&self) -> Result<FileView, Error> {
        let vnode = self.vnode.as_ref().ok_or(Error::Uninitialized)?;
        match vnode.kind() {
            VnodeKind::Regular | VnodeKind::BlockDevice => {}
            VnodeKind::Directory | VnodeKind::CharDevice => {
                return Err(Error::InvalidArgument);
            }
        }

        let backing: Arc<dyn FileBacking> = vnode.clone();
        Ok(FileView {
            backing,
            offset: self.offset,
            read: self.read,
            write: self.write,
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use alloc::boxed::Box;
    use emumem::EmulatedMemory;
    use locks::Mutex;
    use storage::block::Device;
    use storage::ram::RamDisk;
    use virtmem::{Context, ContextKind};

    fn test_vnode(kind: VnodeKind, permissions: Permissions) -> Arc<Vnode> {
        let mem = EmulatedMemory::new(64);
        let registry = Arc::new(mem.registry());
        let kernel = Context::new(ContextKind::Kernel, registry).unwrap();
        let device: Arc<Mutex<Box<dyn Device + Send>>> =
            Arc::new(Mutex::new(Box::new(RamDisk::new(8))));
        Vnode::new(kind, permissions, 4096, device, 0, kernel)
    }

    #[test]
    fn test_map_view_checks() {
        // An unbound handle cannot be mapped.
        assert!(matches!(
            File::unbound().map_view(),
            Err(Error::Uninitialized)
        ));

        // Directories cannot be mapped.
        let dir = test_vnode(VnodeKind::Directory, Permissions::READ);
        let file = File::open(dir, true, false);
        assert!(matches!(file.map_view(), Err(Error::InvalidArgument)));

        // A regular file can.
        let reg = test_vnode(VnodeKind::Regular, Permissions::READ | Permissions::WRITE);
        let mut file = File::open(reg, true, true);
        file.seek(512);
        let view = file.map_view().unwrap();
        assert_eq!(view.offset, 512);
        assert!(view.read && view.write);
    }

    #[test]
    fn test_capabilities_intersect_permissions() {
        // Asking for write on a read-only vnode yields a
        // read-only handle.
        let vnode = test_vnode(VnodeKind::Regular, Permissions::READ);
        let file = File::open(vnode, true, true);
        assert!(file.can_read());
        assert!(!file.can_write());

        let view = file.map_view().unwrap();
        assert!(view.read && !view.write);
    }
}
