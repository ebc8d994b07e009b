//! The core map: everything guarded by the table-wide lock.
//!
//! Frame table, inverted page table, physical memory and the registry of
//! live address spaces change together, so they live in one struct behind
//! one `spin::Mutex` in [`VmKernel`](crate::VmKernel). The core map also
//! knows every CPU's TLB, so a frame that changes hands can be shot down
//! everywhere it is mirrored.

use alloc::{
    collections::BTreeMap,
    collections::BTreeSet,
    format,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::ptr;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use spin::Mutex;

use super::{FrameTable, InvertedPageTable, PhysMemory, PhysPageNum, Pid, TranslationEntry};
use crate::{
    config::MachineConfig,
    error::{VmError, VmResult},
    machine::{SharedTlb, Tlb},
};

/// Paging counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    /// faults that needed a frame
    pub faults:      usize,
    /// TLB misses handled
    pub tlb_misses:  usize,
    /// frames taken from a resident page
    pub evictions:   usize,
    /// pages written to swap
    pub swap_writes: usize,
    /// pages read back from swap
    pub swap_reads:  usize,
    /// pages filled from the program image
    pub image_fills: usize,
    /// pages filled with zeros
    pub zero_fills:  usize,
}

/// Shared paging state
pub struct CoreMap {
    /// owner of every frame
    pub frames: FrameTable,
    /// resident translations
    pub ipt:    InvertedPageTable,
    /// frame contents
    pub memory: PhysMemory,
    /// counters
    pub stats:  VmStats,
    spaces:     BTreeMap<Pid, usize>,
    tlbs:       Vec<Weak<Mutex<Tlb>>>,
    rng:        SmallRng,
}

impl CoreMap {
    /// Empty tables sized by `config`
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            frames: FrameTable::new(config.num_phys_pages),
            ipt:    InvertedPageTable::new(),
            memory: PhysMemory::new(config.num_phys_pages),
            stats:  VmStats::default(),
            spaces: BTreeMap::new(),
            tlbs:   Vec::new(),
            rng:    SmallRng::seed_from_u64(config.random_seed),
        }
    }

    /// Start accepting faults for `pid`.
    pub fn register(&mut self, pid: Pid, page_count: usize) -> VmResult<()> {
        if self.spaces.contains_key(&pid) {
            return Err(VmError::AddressSpaceExists(pid));
        }
        self.spaces.insert(pid, page_count);
        Ok(())
    }
    /// Stop accepting faults for `pid`.
    pub fn unregister(&mut self, pid: Pid) -> bool {
        self.spaces.remove(&pid).is_some()
    }
    /// Logical page count of a live address space
    pub fn page_count(&self, pid: Pid) -> Option<usize> {
        self.spaces.get(&pid).copied()
    }
    /// Live address spaces
    pub fn spaces(&self) -> impl Iterator<Item = Pid> + '_ {
        self.spaces.keys().copied()
    }

    /// Uniformly random number in `[0, bound)`
    pub fn random_below(&mut self, bound: usize) -> usize {
        if bound <= 1 {
            0
        } else {
            self.rng.gen_range(0..bound)
        }
    }
    /// Uniformly random frame
    pub fn random_frame(&mut self) -> PhysPageNum {
        let n = self.frames.len();
        PhysPageNum(self.random_below(n))
    }

    /// Remember `tlb` as one that may mirror frames. CPUs whose processor
    /// is gone are forgotten.
    pub fn attach_tlb(&mut self, tlb: &SharedTlb) {
        self.tlbs.retain(|weak| weak.strong_count() > 0);
        if !self.tlbs.iter().any(|weak| ptr::eq(weak.as_ptr(), Arc::as_ptr(tlb))) {
            debug!("core map: TLB #{} attached", self.tlbs.len());
            self.tlbs.push(Arc::downgrade(tlb));
        }
    }
    /// Attached TLBs still alive
    pub fn tlbs(&self) -> impl Iterator<Item = SharedTlb> + '_ {
        self.tlbs.iter().filter_map(Weak::upgrade)
    }
    /// Invalidate every mirror of frame `ppn` in every attached TLB,
    /// returning the invalidated entries.
    ///
    /// The caller must not hold any TLB lock.
    pub fn shootdown(&self, ppn: PhysPageNum) -> Vec<TranslationEntry> {
        let mut mirrors = Vec::new();
        for tlb in self.tlbs() {
            let mut tlb = tlb.lock();
            for slot in tlb.slots_mapping(ppn) {
                mirrors.push(tlb.invalidate(slot));
            }
        }
        mirrors
    }

    /// Drop every resident page of `pid`, entry and frame together.
    pub fn remove_resident(&mut self, pid: Pid) -> usize {
        let keys = self.ipt.keys_of(pid);
        for key in keys.iter() {
            if let Some(ppn) = self.ipt.remove(*key).and_then(|entry| entry.ppn) {
                self.shootdown(ppn);
                self.frames.free(ppn);
            }
        }
        for ppn in self.frames.frames_of(pid) {
            warn!("core map: {:?} of pid {} had no translation", ppn, pid);
            self.shootdown(ppn);
            self.frames.free(ppn);
        }
        keys.len()
    }

    /// Check that frame table and inverted page table agree.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut used = BTreeSet::new();
        for (key, entry) in self.ipt.iter() {
            let ppn = match entry.ppn {
                Some(ppn) if entry.is_valid() => ppn,
                _ => return Err(format!("{} is in the page table without a frame", key)),
            };
            if !used.insert(ppn) {
                return Err(format!("{:?} is mapped twice", ppn));
            }
            match self.frames.owner(ppn) {
                Some(owner) if owner.key == *key => {}
                owner => {
                    return Err(format!(
                        "{:?} maps {} but the frame table says {:?}",
                        ppn, key, owner
                    ))
                }
            }
            if !self.spaces.contains_key(&key.pid) {
                return Err(format!("{} belongs to no address space", key));
            }
        }
        for (ppn, owner) in self.frames.iter() {
            if !used.contains(&ppn) {
                return Err(format!("{:?} is owned by {} but not mapped", ppn, owner.key));
            }
        }
        for (cpu, tlb) in self.tlbs().enumerate() {
            let tlb = tlb.lock();
            for slot in 0..tlb.len() {
                let mirror = tlb.read(slot);
                let ppn = match mirror.ppn {
                    Some(ppn) if mirror.is_valid() => ppn,
                    _ => continue,
                };
                match self.frames.owner(ppn) {
                    Some(owner) if owner.key.vpn == mirror.vpn => {}
                    owner => {
                        return Err(format!(
                            "TLB #{} slot {} mirrors {:?} for {:?} but the frame table says {:?}",
                            cpu, slot, ppn, mirror.vpn, owner
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}
