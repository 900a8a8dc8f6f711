// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Vnodes: the in-memory representation of file-like objects.

use crate::pagecache::PageCache;
use crate::Permissions;
use alloc::boxed::Box;
use alloc::sync::Arc;
use locks::Mutex;
use memory::PhysFrame;
use storage::block;
use storage::block::Device;
use virtmem::{Context, Error, FaultType, FileBacking, MappedRegion};

/// A vnode's type.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VnodeKind {
    /// A regular file.
    Regular,

    /// A directory.
    Directory,

    /// A block device.
    BlockDevice,

    /// A character device.
    CharDevice,
}

/// The in-memory representation of a file-like object.
///
/// A vnode couples the file's metadata with the block device its
/// bytes live on and the page cache holding them in memory. The
/// device may be a partition, in which case every transfer is
/// shifted by the partition's byte offset.
///
pub struct Vnode {
    kind: VnodeKind,
    permissions: Permissions,
    size: usize,
    partition_offset: usize,
    device: Arc<Mutex<Box<dyn Device + Send>>>,
    cache: PageCache,
}

impl Vnode {
    /// Creates a vnode over the given device.
    ///
    /// `size` is the file's size in bytes;
    /// `partition_offset` is added to every device transfer.
    /// The page cache stores its bytes in `kernel_ctx`.
    ///
    pub fn new(
        kind: VnodeKind,
        permissions: Permissions,
        size: usize,
        device: Arc<Mutex<Box<dyn Device + Send>>>,
        partition_offset: usize,
        kernel_ctx: Arc<Context>,
    ) -> Arc<Vnode> {
        Arc::new(Vnode {
            kind,
            permissions,
            size,
            partition_offset,
            device,
            cache: PageCache::new(kernel_ctx),
        })
    }

    /// Returns the vnode's type.
    ///
    pub fn kind(&self) -> VnodeKind {
        self.kind
    }

    /// Returns the actions permitted on the vnode.
    ///
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Returns the file's size in bytes.
    ///
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the vnode's page cache.
    ///
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Returns the device's segment size in bytes.
    ///
    pub(crate) fn segment_size(&self) -> usize {
        match self.device.lock() {
            Ok(device) => device.segment_size(),
            Err(_) => 0,
        }
    }

    /// Reads whole segments from the device into `buf`,
    /// starting at the given byte offset into the file.
    ///
    /// Both the offset and the buffer length must be whole
    /// multiples of the segment size.
    ///
    pub(crate) fn read_segments(&self, byte_off: usize, buf: &mut [u8]) -> Result<(), Error> {
        let mut device = self.device.lock().map_err(|_| Error::AccessDenied)?;
        let seg = device.segment_size();
        let segment = (byte_off + self.partition_offset) / seg;
        device.read(segment, buf).map_err(io_error)?;
        Ok(())
    }

    /// Writes whole segments from `buf` to the device,
    /// starting at the given byte offset into the file.
    ///
    pub(crate) fn write_segments(&self, byte_off: usize, buf: &[u8]) -> Result<(), Error> {
        let mut device = self.device.lock().map_err(|_| Error::AccessDenied)?;
        let seg = device.segment_size();
        let segment = (byte_off + self.partition_offset) / seg;
        device.write(segment, buf).map_err(io_error)?;
        Ok(())
    }
}

impl FileBacking for Vnode {
    fn file_size(&self) -> usize {
        self.size
    }

    fn get_entry(&self, offset: usize, size: usize) -> Result<FaultType, Error> {
        self.cache.get_entry(self, offset, size)
    }

    fn frame_at(&self, offset: usize) -> Result<(PhysFrame, FaultType), Error> {
        self.cache.frame_at(self, offset)
    }

    fn cached_frame(&self, offset: usize) -> Option<PhysFrame> {
        self.cache.cached_frame(offset)
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        self.cache.dirty_create(self, offset, size);
    }

    fn attach_mapping(&self, region: MappedRegion) -> u64 {
        self.cache.attach_mapping(region)
    }

    fn detach_mapping(&self, id: u64) {
        self.cache.detach_mapping(id);
    }

    fn note_private_mapping(&self) {
        self.cache.note_private_mapping();
    }
}

/// Maps a device error onto the memory manager's status space.
///
fn io_error(err: block::Error) -> Error {
    match err {
        block::Error::NotSupported => Error::AccessDenied,
        _ => Error::InvalidArgument,
    }
}
