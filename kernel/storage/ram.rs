// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A block device backed by ordinary memory.
//!
//! RAM disks carry boot images before real drivers come up, and
//! give the filesystem tests a device with observable contents.

use crate::block::{Device, Error, Operations};
use alloc::vec;
use alloc::vec::Vec;

/// The segment size RAM disks present.
///
const SEGMENT_SIZE: usize = 512;

/// A block device holding its segments in memory.
///
pub struct RamDisk {
    data: Vec<u8>,
    writable: bool,
}

impl RamDisk {
    /// Returns a zero-filled RAM disk with the given number
    /// of segments.
    ///
    pub fn new(num_segments: usize) -> Self {
        RamDisk {
            data: vec![0u8; num_segments * SEGMENT_SIZE],
            writable: true,
        }
    }

    /// Returns a RAM disk holding a copy of the given bytes,
    /// padded with zeroes up to a whole segment.
    ///
    pub fn with_contents(contents: &[u8]) -> Self {
        let segments = (contents.len() + SEGMENT_SIZE - 1) / SEGMENT_SIZE;
        let mut disk = RamDisk::new(segments.max(1));
        disk.data[..contents.len()].copy_from_slice(contents);
        disk
    }

    /// Makes the disk refuse writes.
    ///
    pub fn set_read_only(&mut self) {
        self.writable = false;
    }

    /// Checks that a transfer stays within the disk and uses
    /// whole segments.
    ///
    fn check_transfer(&self, segment: usize, len: usize) -> Result<(), Error> {
        if len == 0 || len % SEGMENT_SIZE != 0 {
            return Err(Error::InvalidBuffer);
        }
        let end = segment
            .checked_mul(SEGMENT_SIZE)
            .and_then(|start| start.checked_add(len))
            .ok_or(Error::OutOfBounds)?;
        if end > self.data.len() {
            return Err(Error::OutOfBounds);
        }

        Ok(())
    }
}

impl Device for RamDisk {
    fn segment_size(&self) -> usize {
        SEGMENT_SIZE
    }

    fn num_segments(&self) -> usize {
        self.data.len() / SEGMENT_SIZE
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn operations(&self) -> Operations {
        if self.writable {
            Operations::READ | Operations::WRITE | Operations::FLUSH
        } else {
            Operations::READ | Operations::FLUSH
        }
    }

    fn read(&mut self, segment: usize, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_transfer(segment, buf.len())?;
        let start = segment * SEGMENT_SIZE;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write(&mut self, segment: usize, buf: &[u8]) -> Result<usize, Error> {
        if !self.writable {
            return Err(Error::NotSupported);
        }
        self.check_transfer(segment, buf.len())?;
        let start = segment * SEGMENT_SIZE;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self, _segment: usize) -> Result<(), Error> {
        // Memory is already as durable as it gets.
        Ok(())
    }
}
