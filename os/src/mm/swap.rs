//! Swap store: backing-store slots for evicted pages.
//!
//! The backing store is one growable file. Slot `n` lives at byte offset
//! `n * PAGE_SIZE`; which key owns which slot is known only to the in-memory
//! slot table, so the file means nothing once the kernel is gone.

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};

use spin::Mutex;

use super::{PageKey, Pid};
use crate::{
    config::PAGE_SIZE,
    error::{VmError, VmResult},
};

/// Byte-addressed file holding swapped pages.
pub trait SwapFile: Send + Sync {
    /// Read into `buf` from `offset`, returning the bytes transferred.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
    /// Write `buf` at `offset`, returning the bytes transferred.
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize;
    /// Flush and release the file.
    fn close(&self) {}
}

/// The file system the swap file lives in.
pub trait SwapFileSystem: Send + Sync {
    /// Open `name`, creating it empty when `create` is set.
    fn open(&self, name: &str, create: bool) -> Option<Arc<dyn SwapFile>>;
    /// Delete `name`.
    fn remove(&self, name: &str) -> bool;
}

/// A file kept in kernel memory
#[derive(Default)]
pub struct MemFile {
    bytes: Mutex<Vec<u8>>,
}

impl MemFile {
    /// Current length in bytes
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }
}

impl SwapFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let bytes = self.bytes.lock();
        if offset >= bytes.len() {
            return 0;
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut bytes = self.bytes.lock();
        if bytes.len() < offset + buf.len() {
            bytes.resize(offset + buf.len(), 0);
        }
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

/// A file system of [`MemFile`]s
#[derive(Default)]
pub struct MemFileSystem {
    files: Mutex<BTreeMap<String, Arc<MemFile>>>,
}

impl MemFileSystem {
    /// An empty file system
    pub fn new() -> Self {
        Self::default()
    }
    /// `name` exists
    pub fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }
}

impl SwapFileSystem for MemFileSystem {
    fn open(&self, name: &str, create: bool) -> Option<Arc<dyn SwapFile>> {
        let mut files = self.files.lock();
        if create {
            let file = Arc::new(MemFile::default());
            files.insert(String::from(name), file.clone());
            Some(file as Arc<dyn SwapFile>)
        } else {
            files.get(name).map(|f| f.clone() as Arc<dyn SwapFile>)
        }
    }
    fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }
}

/// Index of a page-sized slot in the swap file
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    /// Byte offset of the slot in the swap file
    pub fn offset(&self) -> usize {
        self.0 * PAGE_SIZE
    }
}

/// Slot table, free list and transfer counters
pub struct SwapStore {
    file:       Arc<dyn SwapFile>,
    slots:      BTreeMap<PageKey, SwapSlot>,
    free_slots: Vec<SwapSlot>,
    next_slot:  usize,
    writes:     usize,
    reads:      usize,
}

impl SwapStore {
    /// A store with no slots on top of `file`
    pub fn new(file: Arc<dyn SwapFile>) -> Self {
        Self {
            file,
            slots: BTreeMap::new(),
            free_slots: Vec::new(),
            next_slot: 0,
            writes: 0,
            reads: 0,
        }
    }

    /// Write a frame out for `key`, into its own slot if it has one.
    pub fn write_out(&mut self, key: PageKey, frame: &[u8]) -> VmResult<SwapSlot> {
        debug_assert_eq!(frame.len(), PAGE_SIZE);
        let (slot, fresh) = match self.slots.get(&key) {
            Some(slot) => (*slot, false),
            None => (self.alloc_slot(), true),
        };
        let written = self.file.write_at(slot.offset(), frame);
        if written != PAGE_SIZE {
            error!(
                "swap: short write of {} at {:?}: {} of {} bytes",
                key, slot, written, PAGE_SIZE
            );
            if fresh {
                self.free_slots.push(slot);
            }
            return Err(VmError::SwapIo);
        }
        if fresh {
            self.slots.insert(key, slot);
        }
        self.writes += 1;
        debug!("swap: {} written out to {:?}", key, slot);
        Ok(slot)
    }

    /// Read the swapped copy of `key` into `frame`.
    ///
    /// `Ok(false)` means the page was never swapped out. The slot stays
    /// assigned, so a clean page evicted again needs no write.
    pub fn read_in(&mut self, key: PageKey, frame: &mut [u8]) -> VmResult<bool> {
        let slot = match self.slots.get(&key) {
            Some(slot) => *slot,
            None => return Ok(false),
        };
        let read = self.file.read_at(slot.offset(), frame);
        if read != frame.len() {
            error!(
                "swap: short read of {} at {:?}: {} of {} bytes",
                key,
                slot,
                read,
                frame.len()
            );
            return Err(VmError::SwapIo);
        }
        self.reads += 1;
        debug!("swap: {} read in from {:?}", key, slot);
        Ok(true)
    }

    /// Return every slot of `pid` to the free list.
    pub fn release_all(&mut self, pid: Pid) -> usize {
        let keys: Vec<PageKey> = self
            .slots
            .keys()
            .filter(|key| key.pid == pid)
            .copied()
            .collect();
        for key in keys.iter() {
            if let Some(slot) = self.slots.remove(key) {
                self.free_slots.push(slot);
            }
        }
        keys.len()
    }

    fn alloc_slot(&mut self) -> SwapSlot {
        if let Some(slot) = self.free_slots.pop() {
            slot
        } else {
            self.next_slot += 1;
            SwapSlot(self.next_slot - 1)
        }
    }

    /// Slot of `key`, if it was ever written out
    pub fn slot_of(&self, key: PageKey) -> Option<SwapSlot> {
        self.slots.get(&key).copied()
    }
    /// Number of live slots of `pid`
    pub fn slots_of(&self, pid: Pid) -> usize {
        self.slots.keys().filter(|key| key.pid == pid).count()
    }
    /// All live slots
    pub fn iter(&self) -> impl Iterator<Item = (&PageKey, &SwapSlot)> {
        self.slots.iter()
    }
    /// Slots the file has grown to
    pub fn capacity(&self) -> usize {
        self.next_slot
    }
    /// Pages written to the file so far
    pub fn writes(&self) -> usize {
        self.writes
    }
    /// Pages read from the file so far
    pub fn reads(&self) -> usize {
        self.reads
    }
    /// Close the file
    pub fn close(&self) {
        self.file.close();
    }
}
