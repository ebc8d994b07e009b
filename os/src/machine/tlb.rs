//! The hardware TLB: a small array of mirrored translation entries.
//!
//! The TLB only ever holds entries of the process running on its CPU. Bits
//! the hardware sets here are lost unless someone folds them back into the
//! inverted page table before the slot is overwritten or invalidated.

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex;

use crate::mm::{PhysPageNum, TranslationEntry, VirtPageNum};

/// A TLB reachable from other CPUs
pub type SharedTlb = Arc<Mutex<Tlb>>;

/// Fixed-size array of translation entries
pub struct Tlb {
    entries: Vec<TranslationEntry>,
}

impl Tlb {
    /// `size` invalid slots
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![TranslationEntry::empty(); size],
        }
    }
    /// Number of slots
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Copy of slot `index`
    pub fn read(&self, index: usize) -> TranslationEntry {
        self.entries[index]
    }
    /// Overwrite slot `index`
    pub fn write(&mut self, index: usize, entry: TranslationEntry) {
        self.entries[index] = entry;
    }
    /// Slot `index`, for the hardware to set bits in
    pub fn entry_mut(&mut self, index: usize) -> &mut TranslationEntry {
        &mut self.entries[index]
    }
    /// Slot holding a valid translation of `vpn`
    pub fn lookup(&self, vpn: VirtPageNum) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_valid() && entry.vpn == vpn)
    }
    /// Valid slots mapping frame `ppn`
    pub fn slots_mapping(&self, ppn: PhysPageNum) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid() && entry.ppn == Some(ppn))
            .map(|(i, _)| i)
            .collect()
    }
    /// First invalid slot
    pub fn invalid_slot(&self) -> Option<usize> {
        self.entries.iter().position(|entry| !entry.is_valid())
    }
    /// Invalidate slot `index`, returning what it held.
    pub fn invalidate(&mut self, index: usize) -> TranslationEntry {
        let old = self.entries[index];
        self.entries[index].invalidate();
        old
    }
    /// Invalidate every slot without harvesting anything.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.invalidate();
        }
    }
    /// Log every slot
    pub fn dump(&self) {
        trace!("-----------TLB dump---------");
        for (i, entry) in self.entries.iter().enumerate() {
            trace!(
                "{}: valid={}, vpn={:?}, ppn={:?}, readOnly={}, dirty={}, used={}",
                i,
                entry.is_valid(),
                entry.vpn,
                entry.ppn,
                entry.read_only(),
                entry.dirty(),
                entry.referenced()
            );
        }
    }
}
