//! Main memory of the simulated machine

use alloc::{vec, vec::Vec};

use super::{PhysAddr, PhysPageNum};
use crate::config::PAGE_SIZE;

/// Physical memory, `num_frames` frames of [`PAGE_SIZE`] bytes.
///
/// Frames are not cleared when they change hands; whoever fills a frame
/// overwrites all of it.
pub struct PhysMemory {
    bytes: Vec<u8>,
}

impl PhysMemory {
    /// Zeroed memory of `num_frames` frames
    pub fn new(num_frames: usize) -> Self {
        Self {
            bytes: vec![0; num_frames * PAGE_SIZE],
        }
    }
    /// Size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    /// Bytes of one frame
    pub fn frame(&self, ppn: PhysPageNum) -> &[u8] {
        let start = ppn.0 * PAGE_SIZE;
        &self.bytes[start..start + PAGE_SIZE]
    }
    /// Mutable bytes of one frame
    pub fn frame_mut(&mut self, ppn: PhysPageNum) -> &mut [u8] {
        let start = ppn.0 * PAGE_SIZE;
        &mut self.bytes[start..start + PAGE_SIZE]
    }
    /// Fill a frame with zeros
    pub fn zero(&mut self, ppn: PhysPageNum) {
        self.frame_mut(ppn).fill(0);
    }
    /// Copy `buf.len()` bytes starting at `pa` out of memory.
    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes[pa.0..pa.0 + buf.len()]);
    }
    /// Copy `data` into memory starting at `pa`.
    pub fn write(&mut self, pa: PhysAddr, data: &[u8]) {
        self.bytes[pa.0..pa.0 + data.len()].copy_from_slice(data);
    }
}
