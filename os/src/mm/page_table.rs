//! Implementation of [`TranslationEntry`] and the [`PageKey`] naming it.
use core::fmt::{self, Display, Formatter};

use super::{PhysPageNum, VirtPageNum};

/// process identifier
pub type Pid = usize;

bitflags! {
    /// translation entry flags
    pub struct EntryFlags: u8 {
        /// translation may be used
        const V = 1 << 0;
        /// writes raise a read-only exception
        const RO = 1 << 1;
        /// referenced since the page was loaded
        const A = 1 << 2;
        /// written since the page was loaded or written back
        const D = 1 << 3;
    }
}

/// (process, virtual page): the identity of one page of one address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    /// owning process
    pub pid: Pid,
    /// page inside the process
    pub vpn: VirtPageNum,
}

impl PageKey {
    /// Create a key
    pub fn new(pid: Pid, vpn: VirtPageNum) -> Self {
        Self { pid, vpn }
    }
}

impl Display for PageKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.pid, self.vpn.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// translation entry: one virtual page, its frame and status bits
pub struct TranslationEntry {
    /// virtual page number
    pub vpn:   VirtPageNum,
    /// frame holding the page, `None` while it has none
    pub ppn:   Option<PhysPageNum>,
    /// status bits
    pub flags: EntryFlags,
}

impl TranslationEntry {
    /// Create a new translation entry
    pub fn new(vpn: VirtPageNum, ppn: PhysPageNum, flags: EntryFlags) -> Self {
        TranslationEntry {
            vpn,
            ppn: Some(ppn),
            flags,
        }
    }
    /// Create an empty translation entry
    pub fn empty() -> Self {
        TranslationEntry {
            vpn:   VirtPageNum(0),
            ppn:   None,
            flags: EntryFlags::empty(),
        }
    }
    /// The entry maps a frame and may be used
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::V) && self.ppn.is_some()
    }
    /// The page is read-only?
    pub fn read_only(&self) -> bool {
        self.flags.contains(EntryFlags::RO)
    }
    /// The page was referenced?
    pub fn referenced(&self) -> bool {
        self.flags.contains(EntryFlags::A)
    }
    /// The page was written?
    pub fn dirty(&self) -> bool {
        self.flags.contains(EntryFlags::D)
    }
    /// The frame must be written back before it can be reused.
    pub fn needs_writeback(&self) -> bool {
        self.dirty() && !self.read_only()
    }
    /// Record an access.
    pub fn touch(&mut self, writing: bool) {
        self.flags |= EntryFlags::A;
        if writing {
            self.flags |= EntryFlags::D;
        }
    }
    /// OR the referenced and dirty bits of a mirrored copy into this entry.
    pub fn fold(&mut self, mirror: &TranslationEntry) {
        self.flags |= mirror.flags & (EntryFlags::A | EntryFlags::D);
    }
    /// Drop the frame and make the entry unusable.
    pub fn invalidate(&mut self) {
        self.flags.remove(EntryFlags::V);
        self.ppn = None;
    }
}
