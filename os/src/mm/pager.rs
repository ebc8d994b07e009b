//! Page-fault resolution and eviction.
//!
//! A [`Pager`] is built for one fault with the table-wide lock already
//! held: it borrows the [`CoreMap`] out of the guard, the swap store (whose
//! own lock is always taken second) and the TLB of the faulting CPU. No TLB
//! lock is held across pager calls, since eviction shoots the victim down
//! in every attached TLB.

use spin::Mutex;

use super::{
    AddressSpace,
    CoreMap,
    EntryFlags,
    PageKey,
    PhysPageNum,
    SwapStore,
    TranslationEntry,
    VirtAddr,
    VirtPageNum,
    VmStats,
};
use crate::{
    error::{VmError, VmResult},
    machine::SharedTlb,
};

/// Demand pager for one fault
pub struct Pager<'a> {
    core:           &'a mut CoreMap,
    swap:           &'a Mutex<SwapStore>,
    tlb:            &'a SharedTlb,
    victim_retries: usize,
}

impl<'a> Pager<'a> {
    /// A pager over locked tables
    pub fn new(
        core: &'a mut CoreMap,
        swap: &'a Mutex<SwapStore>,
        tlb: &'a SharedTlb,
        victim_retries: usize,
    ) -> Self {
        core.attach_tlb(tlb);
        Self {
            core,
            swap,
            tlb,
            victim_retries,
        }
    }

    /// The locked tables
    pub fn core(&mut self) -> &mut CoreMap {
        self.core
    }

    fn check_range(&self, space: &AddressSpace, vpn: VirtPageNum) -> VmResult<()> {
        let pid = space.pid();
        match self.core.page_count(pid) {
            None => Err(VmError::NoAddressSpace(pid)),
            Some(count) if vpn.0 >= count => Err(VmError::InvalidAddress(VirtAddr::from(vpn).0)),
            Some(_) => Ok(()),
        }
    }

    /// Translation of a page that must already be resident
    pub fn lookup_resident(
        &mut self,
        space: &AddressSpace,
        vpn: VirtPageNum,
    ) -> VmResult<TranslationEntry> {
        self.check_range(space, vpn)?;
        match self.core.ipt.lookup(space.key(vpn)) {
            Some(entry) if entry.is_valid() => Ok(entry),
            _ => Err(VmError::InvalidAddress(VirtAddr::from(vpn).0)),
        }
    }

    /// Make `vpn` of `space` resident and return its translation.
    pub fn resolve(&mut self, space: &AddressSpace, vpn: VirtPageNum) -> VmResult<TranslationEntry> {
        self.check_range(space, vpn)?;
        let key = space.key(vpn);
        if let Some(entry) = self.core.ipt.lookup(key) {
            if entry.is_valid() {
                return Ok(entry);
            }
        }
        self.core.stats.faults += 1;
        let ppn = self.claim_frame(key, false)?;
        let entry = match self.fill(space, key, ppn) {
            Ok(entry) => entry,
            Err(err) => {
                self.core.frames.free(ppn);
                return Err(err);
            }
        };
        self.core.ipt.insert(key, entry);
        trace!("pager: {} -> {:?}", key, ppn);
        Ok(entry)
    }

    /// Load every page of `space` into pinned frames.
    ///
    /// Nothing stays resident if any page fails.
    pub fn preload_pinned(&mut self, space: &AddressSpace) -> VmResult<()> {
        self.check_range(space, VirtPageNum(0))?;
        for vpn in 0..space.page_count() {
            let key = space.key(VirtPageNum(vpn));
            let ppn = match self.claim_frame(key, true) {
                Ok(ppn) => ppn,
                Err(err) => {
                    let dropped = self.core.remove_resident(space.pid());
                    warn!("pager: preload of pid {} failed, dropped {} pages", space.pid(), dropped);
                    return Err(err);
                }
            };
            let core = &mut *self.core;
            let flags = fill_fresh(space, key.vpn, core.memory.frame_mut(ppn), &mut core.stats);
            core.ipt.insert(key, TranslationEntry::new(key.vpn, ppn, flags));
        }
        Ok(())
    }

    fn fill(&mut self, space: &AddressSpace, key: PageKey, ppn: PhysPageNum) -> VmResult<TranslationEntry> {
        let core = &mut *self.core;
        if self.swap.lock().read_in(key, core.memory.frame_mut(ppn))? {
            core.stats.swap_reads += 1;
            return Ok(TranslationEntry::new(key.vpn, ppn, EntryFlags::V));
        }
        let flags = fill_fresh(space, key.vpn, core.memory.frame_mut(ppn), &mut core.stats);
        Ok(TranslationEntry::new(key.vpn, ppn, flags))
    }

    fn claim_frame(&mut self, key: PageKey, pinned: bool) -> VmResult<PhysPageNum> {
        let allocate = |core: &mut CoreMap| {
            if pinned {
                core.frames.allocate_pinned(key)
            } else {
                core.frames.allocate(key)
            }
        };
        if let Some(ppn) = allocate(&mut *self.core) {
            return Ok(ppn);
        }
        let victim = self.select_victim()?;
        self.evict(victim)?;
        allocate(&mut *self.core).ok_or(VmError::OutOfFrames)
    }

    /// Pick an unpinned frame to evict, preferring one the TLB does not map.
    pub fn select_victim(&mut self) -> VmResult<PhysPageNum> {
        let mut fallback = None;
        for _ in 0..self.victim_retries {
            let ppn = self.core.random_frame();
            if !self.core.frames.is_evictable(ppn) {
                continue;
            }
            if !self.mapped_locally(ppn) {
                return Ok(ppn);
            }
            fallback = Some(ppn);
        }
        if let Some(ppn) = fallback {
            return Ok(ppn);
        }
        let tlb = self.tlb.lock();
        let frames = &self.core.frames;
        let evictable = (0..frames.len())
            .map(PhysPageNum)
            .filter(|ppn| frames.is_evictable(*ppn));
        let mut first = None;
        for ppn in evictable {
            if tlb.slots_mapping(ppn).is_empty() {
                return Ok(ppn);
            }
            first.get_or_insert(ppn);
        }
        first.ok_or(VmError::OutOfFrames)
    }

    fn mapped_locally(&self, ppn: PhysPageNum) -> bool {
        !self.tlb.lock().slots_mapping(ppn).is_empty()
    }

    /// Take frame `ppn` away from its page, writing it to swap if needed.
    ///
    /// Every TLB mirroring the frame loses it first, on whichever CPU.
    pub fn evict(&mut self, ppn: PhysPageNum) -> VmResult<()> {
        let key = match self.core.frames.owner(ppn) {
            Some(owner) => owner.key,
            None => return Ok(()),
        };
        for mirror in self.core.shootdown(ppn) {
            self.core.ipt.fold(key, &mirror);
        }
        let core = &mut *self.core;
        let entry = core.ipt.remove(key);
        let dirty = entry.map_or(false, |entry| entry.needs_writeback());
        if dirty {
            if let Err(err) = self.swap.lock().write_out(key, core.memory.frame(ppn)) {
                if let Some(entry) = entry {
                    core.ipt.insert(key, entry);
                }
                return Err(err);
            }
            core.stats.swap_writes += 1;
        }
        core.frames.free(ppn);
        core.stats.evictions += 1;
        debug!("pager: evicted {} from {:?}, dirty={}", key, ppn, dirty);
        Ok(())
    }
}

/// Fill a frame that never went to swap: from the image section backing
/// `vpn`, or with zeros.
fn fill_fresh(space: &AddressSpace, vpn: VirtPageNum, frame: &mut [u8], stats: &mut VmStats) -> EntryFlags {
    match space.image().section_of(vpn) {
        Some((index, section)) => {
            space.image().load_page(index, vpn.0 - section.first_vpn.0, frame);
            stats.image_fills += 1;
            if section.read_only {
                EntryFlags::V | EntryFlags::RO
            } else {
                EntryFlags::V
            }
        }
        None => {
            frame.fill(0);
            stats.zero_fills += 1;
            EntryFlags::V
        }
    }
}
