//! Keeping the hardware TLB and the inverted page table in step.
//!
//! The inverted page table is the only authority on translations. A TLB slot
//! is a copy that the hardware sets referenced and dirty bits in, so every
//! path that drops a slot's content folds those bits back first.

use alloc::vec::Vec;

use super::{CoreMap, PageKey, Pid, TranslationEntry, VirtPageNum};
use crate::machine::Tlb;

/// Pages a process had in the TLB when it was switched out, by slot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlbSnapshot {
    vpns: Vec<Option<VirtPageNum>>,
}

impl TlbSnapshot {
    /// No slot was recorded
    pub fn is_empty(&self) -> bool {
        self.vpns.iter().all(|vpn| vpn.is_none())
    }
    /// Page recorded for each slot
    pub fn slots(&self) -> &[Option<VirtPageNum>] {
        &self.vpns
    }
}

/// Harvest and invalidate every slot of the outgoing process `pid`.
pub fn save_state(core: &mut CoreMap, tlb: &mut Tlb, pid: Pid) -> TlbSnapshot {
    let mut vpns = Vec::with_capacity(tlb.len());
    for i in 0..tlb.len() {
        let entry = tlb.read(i);
        if entry.is_valid() {
            core.ipt.fold(PageKey::new(pid, entry.vpn), &entry);
            tlb.invalidate(i);
            vpns.push(Some(entry.vpn));
        } else {
            vpns.push(None);
        }
    }
    trace!("tlb: saved {} slots of pid {}", vpns.iter().flatten().count(), pid);
    TlbSnapshot { vpns }
}

/// Reinstall the recorded pages of `pid` that are still resident, each in
/// the slot it had; the other slots are left invalid.
pub fn restore_state(core: &CoreMap, tlb: &mut Tlb, pid: Pid, snapshot: &TlbSnapshot) -> usize {
    tlb.invalidate_all();
    let mut restored = 0;
    for (i, vpn) in snapshot.vpns.iter().enumerate().take(tlb.len()) {
        let vpn = match vpn {
            Some(vpn) => *vpn,
            None => continue,
        };
        match core.ipt.lookup(PageKey::new(pid, vpn)) {
            Some(entry) if entry.is_valid() => {
                tlb.write(i, entry);
                restored += 1;
            }
            _ => trace!("tlb: {},{} left since the switch", pid, vpn.0),
        }
    }
    restored
}

/// Put `entry` of the running process `pid` in a slot: the first invalid
/// one, or a random one whose bits are folded back first.
pub fn install(core: &mut CoreMap, tlb: &mut Tlb, pid: Pid, entry: TranslationEntry) -> usize {
    let index = match tlb.invalid_slot() {
        Some(index) => index,
        None => core.random_below(tlb.len()),
    };
    let old = tlb.read(index);
    if old.is_valid() {
        core.ipt.fold(PageKey::new(pid, old.vpn), &old);
    }
    tlb.write(index, entry);
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MachineConfig,
        mm::{EntryFlags, PhysPageNum},
    };

    fn resident(core: &mut CoreMap, pid: Pid, vpn: usize) -> TranslationEntry {
        let key = PageKey::new(pid, VirtPageNum(vpn));
        let ppn = core.frames.allocate(key).unwrap();
        let entry = TranslationEntry::new(key.vpn, ppn, EntryFlags::V);
        core.ipt.insert(key, entry);
        entry
    }

    #[test]
    fn switch_out_folds_and_switch_in_restores() {
        let mut core = CoreMap::new(&MachineConfig::with_frames(4, 3));
        let mut tlb = Tlb::new(3);
        let a = resident(&mut core, 1, 0);
        let b = resident(&mut core, 1, 5);
        tlb.write(0, a);
        tlb.write(2, b);
        tlb.entry_mut(2).touch(true);

        let snapshot = save_state(&mut core, &mut tlb, 1);
        assert_eq!(snapshot.slots(), [Some(VirtPageNum(0)), None, Some(VirtPageNum(5))]);
        assert!(tlb.invalid_slot() == Some(0) && tlb.lookup(VirtPageNum(5)).is_none());
        assert!(core.ipt.lookup(PageKey::new(1, VirtPageNum(5))).unwrap().dirty());

        // page 0 went away while the process was out
        let key = PageKey::new(1, VirtPageNum(0));
        let gone = core.ipt.remove(key).unwrap();
        core.frames.free(gone.ppn.unwrap());

        assert_eq!(restore_state(&core, &mut tlb, 1, &snapshot), 1);
        assert!(!tlb.read(0).is_valid());
        assert_eq!(tlb.lookup(VirtPageNum(5)), Some(2));
        assert!(tlb.read(2).dirty());
    }

    #[test]
    fn overwritten_slots_are_harvested() {
        let mut core = CoreMap::new(&MachineConfig::with_frames(2, 1));
        let mut tlb = Tlb::new(1);
        let a = resident(&mut core, 1, 0);
        let b = resident(&mut core, 1, 1);
        assert_eq!(install(&mut core, &mut tlb, 1, a), 0);
        tlb.entry_mut(0).touch(true);
        assert_eq!(install(&mut core, &mut tlb, 1, b), 0);
        let folded = core.ipt.lookup(PageKey::new(1, VirtPageNum(0))).unwrap();
        assert!(folded.dirty() && folded.referenced());
        assert_eq!(tlb.read(0).ppn, Some(PhysPageNum(1)));
    }
}
