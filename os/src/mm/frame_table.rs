//! Physical frame table
//!
//! One slot per physical frame: empty, or owned by exactly one [`PageKey`].
//! The table does no locking of its own; it lives inside the core map and is
//! only touched with the table-wide lock held, which is what makes the
//! allocation scan atomic.

use alloc::{vec, vec::Vec};

use super::{PageKey, PhysPageNum, Pid};

/// Owner of an allocated frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameOwner {
    /// page stored in the frame
    pub key:    PageKey,
    /// pinned frames are never chosen as eviction victims
    pub pinned: bool,
}

/// Who owns each physical frame
pub struct FrameTable {
    frames: Vec<Option<FrameOwner>>,
}

impl FrameTable {
    /// A table of `num_frames` free frames
    pub fn new(num_frames: usize) -> Self {
        Self {
            frames: vec![None; num_frames],
        }
    }
    /// Number of physical frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }
    /// Number of free frames
    pub fn free_count(&self) -> usize {
        self.frames.iter().filter(|f| f.is_none()).count()
    }
    /// Claim a free frame for `key`.
    pub fn allocate(&mut self, key: PageKey) -> Option<PhysPageNum> {
        self.claim(key, false)
    }
    /// Claim a free frame for `key` that eviction must leave alone.
    pub fn allocate_pinned(&mut self, key: PageKey) -> Option<PhysPageNum> {
        self.claim(key, true)
    }
    fn claim(&mut self, key: PageKey, pinned: bool) -> Option<PhysPageNum> {
        let index = self.frames.iter().position(|f| f.is_none())?;
        self.frames[index] = Some(FrameOwner { key, pinned });
        trace!("frame table: {:?} -> {}", PhysPageNum(index), key);
        Some(PhysPageNum(index))
    }
    /// Release a frame, returning whoever held it.
    pub fn free(&mut self, ppn: PhysPageNum) -> Option<FrameOwner> {
        let owner = self.frames[ppn.0].take();
        if owner.is_none() {
            debug!("frame table: {:?} freed while already free", ppn);
        }
        owner
    }
    /// Current owner of a frame
    pub fn owner(&self, ppn: PhysPageNum) -> Option<FrameOwner> {
        self.frames.get(ppn.0).copied().flatten()
    }
    /// The frame is allocated and may be evicted
    pub fn is_evictable(&self, ppn: PhysPageNum) -> bool {
        matches!(self.owner(ppn), Some(owner) if !owner.pinned)
    }
    /// Allocated frames with their owners
    pub fn iter(&self) -> impl Iterator<Item = (PhysPageNum, FrameOwner)> + '_ {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.map(|owner| (PhysPageNum(i), owner)))
    }
    /// Frames held by one process
    pub fn frames_of(&self, pid: Pid) -> Vec<PhysPageNum> {
        self.iter()
            .filter(|(_, owner)| owner.key.pid == pid)
            .map(|(ppn, _)| ppn)
            .collect()
    }
}
