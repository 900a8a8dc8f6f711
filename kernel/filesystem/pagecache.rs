// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The page cache: each file's bytes, held in kernel memory.
//!
//! A cache lazily reserves a span of the kernel address space
//! sized to its file, commits individual pages as they are first
//! needed, and fills them from the owning block device. The
//! frames behind committed pages are shared with every mapping of
//! the file, so a write through a shared mapping lands in the
//! cache; the dirty-region list records what needs writing back.
//!
//! The dirty list is guarded by a sleepable mutex, because
//! flushing calls into the device driver. The frame and
//! mapped-region indexes are guarded by a spinlock, because the
//! memory manager consults them while holding a context spinlock.

use crate::vnode::Vnode;
use align::{align_down_usize, align_up_usize};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp;
use core::sync::atomic::{AtomicUsize, Ordering};
use locks::{lock, Mutex, SpinLock};
use memory::{PhysFrame, VirtAddr, VirtPageSize};
use virtmem::{AllocFlags, Context, Error, FaultType, MappedRegion, ProtFlags};

/// A half-open window of a file that has been written through a
/// shared mapping and needs writing back.
///
/// Regions may touch but never overlap, and always lie within
/// the file.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirtyRegion {
    /// The file byte offset at which the region starts.
    pub fileoff: usize,

    /// The region's size in bytes.
    pub size: usize,
}

/// A file's cached bytes, plus the dirty-region and
/// mapped-region indexes.
///
pub struct PageCache {
    kernel_ctx: Arc<Context>,

    // The number of holders keeping the cache alive. The
    // owning vnode holds one.
    refcnt: AtomicUsize,

    // The base of the reserved kernel span, or 0 before the
    // first use. Only written under the io mutex.
    data: AtomicUsize,

    // The span's size in bytes.
    span: AtomicUsize,

    // Serialises span creation and page commits.
    io: Mutex<()>,

    // What needs writing back. Sleepable: flushing talks to
    // the driver.
    dirty: Mutex<Vec<DirtyRegion>>,

    // The committed pages' frames and the reverse index of
    // mappings consuming them. Spinlocked: the memory manager
    // reads these under a context spinlock.
    index: SpinLock<CacheIndex>,
}

struct CacheIndex {
    frames: BTreeMap<usize, PhysFrame>,
    mapped: BTreeMap<u64, MappedRegion>,
    next_region: u64,
    private: bool,
}

impl PageCache {
    /// Returns an empty cache storing its bytes in the given
    /// kernel context.
    ///
    pub fn new(kernel_ctx: Arc<Context>) -> Self {
        PageCache {
            kernel_ctx,
            refcnt: AtomicUsize::new(1),
            data: AtomicUsize::new(0),
            span: AtomicUsize::new(0),
            io: Mutex::new(()),
            dirty: Mutex::new(Vec::new()),
            index: SpinLock::new(CacheIndex {
                frames: BTreeMap::new(),
                mapped: BTreeMap::new(),
                next_region: 1,
                private: false,
            }),
        }
    }

    /// Takes a reference to the cache.
    ///
    pub fn ref_cache(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference to the cache. When the last reference
    /// goes, the cached span is released and every mapped-region
    /// back-pointer is invalidated.
    ///
    pub fn unref_cache(&self) {
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let _io = match self.io.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let data = self.data.swap(0, Ordering::AcqRel);
        let span = self.span.swap(0, Ordering::AcqRel);
        {
            let mut index = lock!(self.index);
            index.frames.clear();
            index.mapped.clear();
        }

        if data != 0 {
            // The span's committed pages go back to the
            // system.
            let _ = self.kernel_ctx.free(VirtAddr::new(data), span);
        }
    }

    /// Returns the base of the cached span, if the cache has
    /// been used.
    ///
    pub fn data_base(&self) -> Option<VirtAddr> {
        match self.data.load(Ordering::Acquire) {
            0 => None,
            data => Some(VirtAddr::new(data)),
        }
    }

    /// Ensures that every page covering `[offset, offset + size)`
    /// is committed and filled, reading from the device for any
    /// page that was not already present.
    ///
    /// Returns [`FaultType::Soft`] if every page was already
    /// present, and [`FaultType::Hard`] if any had to be read.
    ///
    pub fn get_entry(&self, vnode: &Vnode, offset: usize, size: usize) -> Result<FaultType, Error> {
        if offset >= vnode.size() {
            return Err(Error::InvalidArgument);
        }
        if size == 0 {
            return Ok(FaultType::Soft);
        }

        let size = cmp::min(size, vnode.size() - offset);
        let pg = VirtPageSize::Size4KiB.bytes();

        let _io = self.io.lock().map_err(|_| Error::AccessDenied)?;
        let data = self.ensure_span(vnode)?;

        let first = offset / pg;
        let last = (offset + size - 1) / pg;
        let mut fault_type = FaultType::Soft;
        for index in first..=last {
            if self.frame_for_index(index).is_some() {
                continue;
            }

            let addr = data + index * pg;
            match self.kernel_ctx.allocate(
                Some(addr),
                pg,
                ProtFlags::empty(),
                AllocFlags::empty(),
                None,
            ) {
                Ok(_) => {}
                // A page committed by an interrupted fill
                // holds nothing useful; fill it again.
                Err(Error::InUse) => {}
                Err(err) => return Err(err),
            }

            // Fill the page from the device, in whole
            // segments, and remember the frame that ended up
            // holding it.
            let seg = vnode.segment_size();
            if seg == 0 {
                return Err(Error::InvalidArgument);
            }
            let file_bytes = vnode.size() - index * pg;
            let fill = cmp::min(pg, align_up_usize(file_bytes, seg));
            let mut buf = vec![0u8; fill];
            vnode.read_segments(index * pg, &mut buf)?;
            self.kernel_ctx.write_bytes(addr, &buf)?;

            let info = self.kernel_ctx.query(addr).ok_or(Error::NotEnoughMemory)?;
            let mut cache_index = lock!(self.index);
            cache_index.frames.insert(index, info.frame);
            drop(cache_index);

            fault_type = FaultType::Hard;
        }

        Ok(fault_type)
    }

    /// Ensures the page covering `offset` is committed and
    /// returns the physical frame holding it.
    ///
    pub fn frame_at(&self, vnode: &Vnode, offset: usize) -> Result<(PhysFrame, FaultType), Error> {
        if let Some(frame) = self.cached_frame(offset) {
            return Ok((frame, FaultType::Soft));
        }

        let fault_type = self.get_entry(vnode, offset, 1)?;
        let frame = self.cached_frame(offset).ok_or(Error::NotEnoughMemory)?;

        Ok((frame, fault_type))
    }

    /// Returns the frame holding the page covering `offset`,
    /// only if the cache already holds it.
    ///
    pub fn cached_frame(&self, offset: usize) -> Option<PhysFrame> {
        self.frame_for_index(offset / VirtPageSize::Size4KiB.bytes())
    }

    /// Returns the frame holding the page with the given
    /// index.
    ///
    fn frame_for_index(&self, index: usize) -> Option<PhysFrame> {
        lock!(self.index).frames.get(&index).copied()
    }

    /// Reserves the cache's kernel span if it has not been
    /// reserved yet. The io mutex must be held.
    ///
    fn ensure_span(&self, vnode: &Vnode) -> Result<VirtAddr, Error> {
        let data = self.data.load(Ordering::Acquire);
        if data != 0 {
            return Ok(VirtAddr::new(data));
        }

        let pg = VirtPageSize::Size4KiB.bytes();
        let span = align_up_usize(vnode.size(), pg);
        let base = self.kernel_ctx.allocate(
            None,
            span,
            ProtFlags::empty(),
            AllocFlags::RESERVE | AllocFlags::NON_PAGED,
            None,
        )?;

        self.data.store(base.as_usize(), Ordering::Release);
        self.span.store(span, Ordering::Release);
        Ok(base)
    }

    /// Records that `[fileoff, fileoff + size)` has been
    /// written and needs writing back.
    ///
    /// The upsert is idempotent: a window covered by an
    /// existing region extends it at most; a window abutting a
    /// region's end grows it; anything else becomes a new
    /// region. Regions are clamped to the file and never
    /// overlap.
    ///
    pub fn dirty_create(&self, vnode: &Vnode, fileoff: usize, size: usize) {
        if size == 0 || fileoff >= vnode.size() {
            return;
        }

        let size = cmp::min(size, vnode.size() - fileoff);
        let mut dirty = match self.dirty.lock() {
            Ok(dirty) => dirty,
            Err(_) => return,
        };

        let mut found = false;
        for region in dirty.iter_mut() {
            // Within the region, or abutting its end.
            if fileoff >= region.fileoff && fileoff <= region.fileoff + region.size {
                let end = cmp::max(region.fileoff + region.size, fileoff + size);
                region.size = end - region.fileoff;
                found = true;
                break;
            }
        }

        if !found {
            dirty.push(DirtyRegion { fileoff, size });
        }

        coalesce(&mut dirty);
    }

    /// Returns the dirty region containing `fileoff`, if any.
    ///
    pub fn dirty_lookup(&self, fileoff: usize) -> Option<DirtyRegion> {
        let dirty = self.dirty.lock().ok()?;
        dirty
            .iter()
            .find(|region| fileoff >= region.fileoff && fileoff < region.fileoff + region.size)
            .copied()
    }

    /// Returns the number of dirty regions.
    ///
    pub fn dirty_count(&self) -> usize {
        match self.dirty.lock() {
            Ok(dirty) => dirty.len(),
            Err(_) => 0,
        }
    }

    /// Writes every dirty region back to the device, one write
    /// per region, and drops the region records. On return the
    /// dirty list is empty.
    ///
    pub fn flush(&self, vnode: &Vnode) -> Result<(), Error> {
        let mut dirty = self.dirty.lock().map_err(|_| Error::AccessDenied)?;
        let data = match self.data_base() {
            Some(data) => data,
            None => {
                dirty.clear();
                return Ok(());
            }
        };

        let seg = vnode.segment_size();
        if seg == 0 {
            return Err(Error::InvalidArgument);
        }

        for region in dirty.drain(..) {
            // Whole segments covering the region.
            let start = align_down_usize(region.fileoff, seg);
            let end = align_up_usize(region.fileoff + region.size, seg);
            let mut buf = vec![0u8; end - start];
            self.kernel_ctx.read_bytes(data + start, &mut buf)?;
            vnode.write_segments(start, &buf)?;
        }

        Ok(())
    }

    /// Adds a mapping to the reverse index, returning its
    /// handle.
    ///
    pub fn attach_mapping(&self, region: MappedRegion) -> u64 {
        let mut index = lock!(self.index);
        let id = index.next_region;
        index.next_region += 1;
        index.mapped.insert(id, region);
        id
    }

    /// Removes a mapping from the reverse index.
    ///
    pub fn detach_mapping(&self, id: u64) {
        lock!(self.index).mapped.remove(&id);
    }

    /// Returns a snapshot of the mappings consuming the
    /// cache's pages.
    ///
    pub fn mapped_regions(&self) -> Vec<MappedRegion> {
        lock!(self.index).mapped.values().copied().collect()
    }

    /// Notes that a private mapping shares the cache's frames,
    /// making the cache's own span copy-on-write.
    ///
    pub fn note_private_mapping(&self) {
        lock!(self.index).private = true;
    }

    /// Returns whether any private mapping shares the cache's
    /// frames.
    ///
    pub fn is_private(&self) -> bool {
        lock!(self.index).private
    }
}

/// Merges overlapping dirty regions, keeping the list sorted.
/// Touching regions stay separate; only true overlap merges.
///
fn coalesce(dirty: &mut Vec<DirtyRegion>) {
    dirty.sort_unstable_by_key(|region| region.fileoff);

    let mut i = 0;
    while i + 1 < dirty.len() {
        let end = dirty[i].fileoff + dirty[i].size;
        if end > dirty[i + 1].fileoff {
            let next_end = dirty[i + 1].fileoff + dirty[i + 1].size;
            dirty[i].size = cmp::max(end, next_end) - dirty[i].fileoff;
            dirty.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::file::File;
    use crate::vnode::VnodeKind;
    use crate::Permissions;
    use alloc::boxed::Box;
    use emumem::EmulatedMemory;
    use storage::block::Device;
    use storage::ram::RamDisk;
    use virtmem::ContextKind;

    const PAGE: usize = 4096;

    struct Fixture {
        kernel: Arc<Context>,
        user: Arc<Context>,
        vnode: Arc<Vnode>,
        device: Arc<Mutex<Box<dyn Device + Send>>>,
    }

    fn fixture(file_size: usize, fill: u8) -> Fixture {
        let mem = EmulatedMemory::new(1024);
        let registry = Arc::new(mem.registry());
        let kernel = Context::new(ContextKind::Kernel, registry.clone()).unwrap();
        let user = Context::new(ContextKind::User, registry).unwrap();

        let contents = vec![fill; file_size];
        let device: Arc<Mutex<Box<dyn Device + Send>>> =
            Arc::new(Mutex::new(Box::new(RamDisk::with_contents(&contents))));

        let vnode = Vnode::new(
            VnodeKind::Regular,
            Permissions::READ | Permissions::WRITE,
            file_size,
            device.clone(),
            0,
            kernel.clone(),
        );

        Fixture {
            kernel,
            user,
            vnode,
            device,
        }
    }

    fn device_byte(device: &Arc<Mutex<Box<dyn Device + Send>>>, offset: usize) -> u8 {
        let mut device = device.lock().unwrap();
        let mut buf = [0u8; 512];
        device.read(offset / 512, &mut buf).unwrap();
        buf[offset % 512]
    }

    #[test]
    fn test_shared_file_mapping() {
        let fx = fixture(3 * PAGE, b'A');
        let file = File::open(fx.vnode.clone(), true, true);
        let view = file.map_view().unwrap();

        let base = fx
            .user
            .allocate(
                None,
                3 * PAGE,
                virtmem::ProtFlags::empty(),
                AllocFlags::empty(),
                Some(&view),
            )
            .unwrap();

        // The mapping is registered with the cache.
        assert_eq!(fx.vnode.cache().mapped_regions().len(), 1);

        // The first read pages the file content in.
        let mut byte = [0u8; 1];
        fx.user.read_bytes(base, &mut byte).unwrap();
        assert_eq!(byte[0], b'A');
        fx.user.read_bytes(base + 2 * PAGE + 17, &mut byte).unwrap();
        assert_eq!(byte[0], b'A');

        // The cache and the mapping share the frame.
        let user_frame = fx.user.query(base).unwrap().frame;
        let cache_frame = fx.vnode.cache().cached_frame(0).unwrap();
        assert_eq!(user_frame, cache_frame);
        assert_eq!(
            fx.user.registry().refcount(cache_frame.start_address()),
            Some(2)
        );

        // Writing dirties the cache, and flushing pushes the
        // byte to the device.
        fx.user.write_bytes(base, b"Z").unwrap();
        assert!(fx.vnode.cache().dirty_lookup(0).is_some());

        fx.vnode.cache().flush(&fx.vnode).unwrap();
        assert_eq!(fx.vnode.cache().dirty_count(), 0);
        assert_eq!(device_byte(&fx.device, 0), b'Z');
        assert_eq!(device_byte(&fx.device, 1), b'A');
    }

    #[test]
    fn test_shared_write_before_read() {
        let fx = fixture(2 * PAGE, b'A');
        let file = File::open(fx.vnode.clone(), true, true);
        let view = file.map_view().unwrap();

        let base = fx
            .user
            .allocate(
                None,
                2 * PAGE,
                virtmem::ProtFlags::empty(),
                AllocFlags::empty(),
                Some(&view),
            )
            .unwrap();

        // A write to a page that was never read must page it
        // in, dirty it, and land in the cache.
        fx.user.write_bytes(base + PAGE, b"Q").unwrap();
        assert!(fx.vnode.cache().dirty_lookup(PAGE).is_some());

        // The rest of the page kept the file's content.
        let mut byte = [0u8; 1];
        fx.user.read_bytes(base + PAGE + 1, &mut byte).unwrap();
        assert_eq!(byte[0], b'A');

        fx.vnode.cache().flush(&fx.vnode).unwrap();
        assert_eq!(device_byte(&fx.device, PAGE), b'Q');
        assert_eq!(device_byte(&fx.device, PAGE + 1), b'A');
    }

    #[test]
    fn test_private_file_mapping() {
        let fx = fixture(3 * PAGE, b'A');
        let file = File::open(fx.vnode.clone(), true, true);
        let view = file.map_view().unwrap();

        let base = fx
            .user
            .allocate(
                None,
                3 * PAGE,
                virtmem::ProtFlags::empty(),
                AllocFlags::PRIVATE,
                Some(&view),
            )
            .unwrap();
        assert!(fx.vnode.cache().is_private());

        // The private mapping starts on the cache's frames,
        // read-only.
        let info = fx.user.query(base).unwrap();
        assert!(info.flags.present() && info.flags.read_only());
        assert_eq!(info.frame, fx.vnode.cache().cached_frame(0).unwrap());

        // A write peels a private copy.
        fx.user.write_bytes(base, b"X").unwrap();
        let mut byte = [0u8; 1];
        fx.user.read_bytes(base, &mut byte).unwrap();
        assert_eq!(byte[0], b'X');
        let peeled = fx.user.query(base).unwrap().frame;
        assert_ne!(peeled, fx.vnode.cache().cached_frame(0).unwrap());

        // The write dirtied nothing; the file and the cache
        // still hold the original byte.
        assert_eq!(fx.vnode.cache().dirty_count(), 0);
        fx.vnode.cache().flush(&fx.vnode).unwrap();
        assert_eq!(device_byte(&fx.device, 0), b'A');

        let data = fx.vnode.cache().data_base().unwrap();
        let mut cached = [0u8; 1];
        fx.kernel.read_bytes(data, &mut cached).unwrap();
        assert_eq!(cached[0], b'A');

        // The rest of the peeled page carried the file
        // content over.
        fx.user.read_bytes(base + 1, &mut byte).unwrap();
        assert_eq!(byte[0], b'A');
    }

    #[test]
    fn test_get_entry_soft_and_hard() {
        let fx = fixture(2 * PAGE, b'B');

        // First population reads from the device.
        let first = fx.vnode.cache().get_entry(&fx.vnode, 0, 2 * PAGE).unwrap();
        assert_eq!(first, FaultType::Hard);

        // Re-populating the same window is soft.
        let second = fx.vnode.cache().get_entry(&fx.vnode, 0, 2 * PAGE).unwrap();
        assert_eq!(second, FaultType::Soft);

        // Beyond the file is an error.
        assert!(fx
            .vnode
            .cache()
            .get_entry(&fx.vnode, 2 * PAGE, PAGE)
            .is_err());
    }

    #[test]
    fn test_dirty_region_upsert() {
        let fx = fixture(4 * PAGE, 0);
        let cache = fx.vnode.cache();

        // The same window twice produces one region, not two.
        cache.dirty_create(&fx.vnode, 0, 512);
        cache.dirty_create(&fx.vnode, 0, 512);
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(
            cache.dirty_lookup(0),
            Some(DirtyRegion {
                fileoff: 0,
                size: 512
            })
        );

        // An abutting window grows the region.
        cache.dirty_create(&fx.vnode, 512, 512);
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.dirty_lookup(700).unwrap().size, 1024);

        // A separated window becomes its own region.
        cache.dirty_create(&fx.vnode, 2 * PAGE, 512);
        assert_eq!(cache.dirty_count(), 2);
        assert!(cache.dirty_lookup(1500).is_none());

        // A covering window swallows what it overlaps.
        cache.dirty_create(&fx.vnode, 0, 2 * PAGE + 512);
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.dirty_lookup(0).unwrap().size, 2 * PAGE + 512);

        // Writes beyond the file are ignored, and writes
        // crossing the end are clamped.
        cache.dirty_create(&fx.vnode, 5 * PAGE, 512);
        assert_eq!(cache.dirty_count(), 1);
        cache.dirty_create(&fx.vnode, 4 * PAGE - 256, 4096);
        let last = cache.dirty_lookup(4 * PAGE - 1).unwrap();
        assert_eq!(last.fileoff + last.size, 4 * PAGE);
    }

    #[test]
    fn test_flush_writes_each_region_once() {
        let fx = fixture(4 * PAGE, b'C');
        let cache = fx.vnode.cache();

        // Populate two pages and modify them through the
        // cache span directly, as a shared mapping would.
        cache.get_entry(&fx.vnode, 0, PAGE).unwrap();
        cache.get_entry(&fx.vnode, 2 * PAGE, PAGE).unwrap();
        let data = cache.data_base().unwrap();
        fx.kernel.write_bytes(data, b"11").unwrap();
        fx.kernel.write_bytes(data + 2 * PAGE, b"22").unwrap();
        cache.dirty_create(&fx.vnode, 0, 2);
        cache.dirty_create(&fx.vnode, 2 * PAGE, 2);
        assert_eq!(cache.dirty_count(), 2);

        cache.flush(&fx.vnode).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(device_byte(&fx.device, 0), b'1');
        assert_eq!(device_byte(&fx.device, 1), b'1');
        assert_eq!(device_byte(&fx.device, 2), b'C');
        assert_eq!(device_byte(&fx.device, 2 * PAGE), b'2');

        // Flushing again with nothing dirty is a no-op.
        cache.flush(&fx.vnode).unwrap();
        assert_eq!(device_byte(&fx.device, 0), b'1');
    }

    #[test]
    fn test_unref_frees_span() {
        let fx = fixture(2 * PAGE, b'D');
        let cache = fx.vnode.cache();

        cache.get_entry(&fx.vnode, 0, 2 * PAGE).unwrap();
        assert!(cache.data_base().is_some());
        let ranges_live = fx.kernel.range_count();
        assert!(ranges_live > 0);

        // The vnode holds the only reference; dropping it
        // releases the span and the back-pointers.
        cache.unref_cache();
        assert!(cache.data_base().is_none());
        assert!(cache.mapped_regions().is_empty());
        assert!(fx.kernel.range_count() < ranges_live);

        // The cache can be repopulated afterwards.
        cache.ref_cache();
        assert_eq!(
            cache.get_entry(&fx.vnode, 0, PAGE).unwrap(),
            FaultType::Hard
        );
        let mut byte = [0u8; 1];
        fx.kernel
            .read_bytes(cache.data_base().unwrap(), &mut byte)
            .unwrap();
        assert_eq!(byte[0], b'D');
    }

    #[test]
    fn test_partition_offset() {
        let mem = EmulatedMemory::new(512);
        let registry = Arc::new(mem.registry());
        let kernel = Context::new(ContextKind::Kernel, registry).unwrap();

        // A disk with two junk segments, then the partition's
        // content.
        let mut contents = vec![0xee_u8; 1024];
        contents.extend_from_slice(&[b'P'; 512]);
        let device: Arc<Mutex<Box<dyn Device + Send>>> =
            Arc::new(Mutex::new(Box::new(RamDisk::with_contents(&contents))));

        let vnode = Vnode::new(
            VnodeKind::Regular,
            Permissions::READ | Permissions::WRITE,
            512,
            device,
            1024,
            kernel.clone(),
        );

        vnode.cache().get_entry(&vnode, 0, 512).unwrap();
        let mut byte = [0u8; 1];
        kernel
            .read_bytes(vnode.cache().data_base().unwrap(), &mut byte)
            .unwrap();
        assert_eq!(byte[0], b'P');
    }

    #[test]
    fn test_freeing_mapping_detaches_region() {
        let fx = fixture(2 * PAGE, b'E');
        let file = File::open(fx.vnode.clone(), true, true);
        let view = file.map_view().unwrap();

        let base = fx
            .user
            .allocate(
                None,
                2 * PAGE,
                virtmem::ProtFlags::empty(),
                AllocFlags::empty(),
                Some(&view),
            )
            .unwrap();
        assert_eq!(fx.vnode.cache().mapped_regions().len(), 1);

        // A partial free swaps the single record for the
        // survivor's record.
        fx.user.free(base, PAGE).unwrap();
        let regions = fx.vnode.cache().mapped_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].virt, base + PAGE);

        // Freeing the rest clears the index.
        fx.user.free(base + PAGE, PAGE).unwrap();
        assert!(fx.vnode.cache().mapped_regions().is_empty());
    }

    #[test]
    fn test_file_offset_mapping() {
        let fx = fixture(4 * PAGE, 0);

        // Give the file distinguishable pages.
        let cache = fx.vnode.cache();
        cache.get_entry(&fx.vnode, 0, 4 * PAGE).unwrap();
        let data = cache.data_base().unwrap();
        for i in 0..4 {
            fx.kernel
                .write_bytes(data + i * PAGE, &[b'0' + i as u8])
                .unwrap();
        }

        // Map from the second page onwards.
        let mut file = File::open(fx.vnode.clone(), true, true);
        file.seek(PAGE);
        let view = file.map_view().unwrap();
        let base = fx
            .user
            .allocate(
                None,
                4 * PAGE,
                virtmem::ProtFlags::empty(),
                AllocFlags::empty(),
                Some(&view),
            )
            .unwrap();

        // The window was clamped to the remaining file.
        let range = fx.user.range_at(base).unwrap();
        assert_eq!(range.size, 3 * PAGE);

        // The mapping's first page is the file's second.
        let mut byte = [0u8; 1];
        fx.user.read_bytes(base, &mut byte).unwrap();
        assert_eq!(byte[0], b'1');
        fx.user.read_bytes(base + 2 * PAGE, &mut byte).unwrap();
        assert_eq!(byte[0], b'3');
    }
}
