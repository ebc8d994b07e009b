//! [`VmKernel`]: the service object owning the shared paging state.
//!
//! One instance exists per simulated machine. It holds the table-wide lock
//! around the [`CoreMap`] and, behind a second lock always taken after it,
//! the [`SwapStore`]. Processes and the trap layer reach the tables only
//! through it.
//!
//! Any number of [`Processor`]s may share one kernel. Each CPU's TLB is
//! attached to the core map the first time the kernel touches it, and a
//! CPU's TLB lock is only ever taken after the table-wide lock.

use alloc::{collections::BTreeSet, format, string::String, sync::Arc};

use spin::Mutex;

use crate::{
    config::MachineConfig,
    error::{VmError, VmResult},
    machine::{ExceptionCause, Processor, SharedTlb, MAX_USER_ADDR},
    mm::{
        tlb_sync,
        AddressSpace,
        CoreMap,
        Pager,
        PhysAddr,
        PhysMemory,
        Pid,
        SwapFileSystem,
        SwapStore,
        TlbSnapshot,
        VirtAddr,
        VirtPageNum,
    },
    task::AddressTranslation,
};
pub use crate::mm::VmStats;

/// Frame table, inverted page table, physical memory and swap of a machine
pub struct VmKernel {
    config: MachineConfig,
    core:   Mutex<CoreMap>,
    swap:   Mutex<SwapStore>,
    fs:     Arc<dyn SwapFileSystem>,
}

impl VmKernel {
    /// Bring up paging, creating the swap file in `fs`.
    pub fn new(config: MachineConfig, fs: Arc<dyn SwapFileSystem>) -> VmResult<Self> {
        config.validate()?;
        let file = match fs.open(&config.swap_file, true) {
            Some(file) => file,
            None => {
                error!("vm: cannot create swap file {}", config.swap_file);
                return Err(VmError::SwapUnavailable);
            }
        };
        info!(
            "vm: {} frames of {} bytes, {} TLB slots, swap in {}",
            config.num_phys_pages,
            crate::config::PAGE_SIZE,
            config.tlb_size,
            config.swap_file
        );
        Ok(Self {
            core: Mutex::new(CoreMap::new(&config)),
            swap: Mutex::new(SwapStore::new(file)),
            config,
            fs,
        })
    }

    /// Machine parameters
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Accept faults for `pid` on pages `[0, page_count)`.
    pub fn create_address_space(&self, pid: Pid, page_count: usize) -> VmResult<()> {
        self.core.lock().register(pid, page_count)?;
        debug!("vm: address space of pid {} with {} pages", pid, page_count);
        Ok(())
    }

    /// Drop every page, frame and swap slot of `pid`.
    pub fn destroy_address_space(&self, pid: Pid) -> VmResult<()> {
        let mut core = self.core.lock();
        if !core.unregister(pid) {
            return Err(VmError::NoAddressSpace(pid));
        }
        let pages = core.remove_resident(pid);
        let slots = self.swap.lock().release_all(pid);
        debug!("vm: pid {} torn down, {} frames and {} slots released", pid, pages, slots);
        Ok(())
    }

    /// Run `f` with a pager over the locked tables.
    pub fn with_pager<R>(&self, tlb: &SharedTlb, f: impl FnOnce(&mut Pager<'_>) -> R) -> R {
        let mut core = self.core.lock();
        let mut pager = Pager::new(&mut core, &self.swap, tlb, self.config.victim_retries);
        f(&mut pager)
    }

    /// Resolve a TLB miss at `vaddr` and install the translation, returning
    /// the slot used.
    pub fn handle_tlb_miss(
        &self,
        cpu: &mut Processor,
        space: &AddressSpace,
        strategy: &dyn AddressTranslation,
        vaddr: usize,
    ) -> VmResult<usize> {
        if vaddr > MAX_USER_ADDR {
            return Err(VmError::InvalidAddress(vaddr));
        }
        let vpn = VirtAddr::from(vaddr).floor();
        let mut core = self.core.lock();
        core.stats.tlb_misses += 1;
        let entry = {
            let mut pager = Pager::new(
                &mut core,
                &self.swap,
                cpu.shared_tlb(),
                self.config.victim_retries,
            );
            strategy.translate(&mut pager, space, vpn)?
        };
        let slot = tlb_sync::install(&mut core, &mut cpu.tlb(), space.pid(), entry);
        trace!("vm: {:#x} of pid {} in TLB slot {}", vaddr, space.pid(), slot);
        Ok(slot)
    }

    /// Run `f` on the frame of page `vpn`, with the table-wide lock held.
    ///
    /// Returns `Ok(false)` without calling `f` when writing to a read-only
    /// page. The page is marked referenced, and dirty when `writing`.
    pub fn access_page(
        &self,
        cpu: &mut Processor,
        space: &AddressSpace,
        strategy: &dyn AddressTranslation,
        vpn: VirtPageNum,
        writing: bool,
        f: impl FnOnce(&mut [u8]),
    ) -> VmResult<bool> {
        let mut core = self.core.lock();
        let entry = {
            let mut pager = Pager::new(
                &mut core,
                &self.swap,
                cpu.shared_tlb(),
                self.config.victim_retries,
            );
            strategy.translate(&mut pager, space, vpn)?
        };
        if writing && entry.read_only() {
            return Ok(false);
        }
        let ppn = entry
            .ppn
            .ok_or_else(|| VmError::InvalidAddress(VirtAddr::from(vpn).0))?;
        if let Some(master) = core.ipt.lookup_mut(space.key(vpn)) {
            master.touch(writing);
        }
        f(core.memory.frame_mut(ppn));
        Ok(true)
    }

    /// Translate `vaddr` through the TLB of `cpu` and run `f` on physical
    /// memory at the result.
    ///
    /// Translation and access happen under the table-wide lock, so no other
    /// CPU can evict the frame in between.
    pub fn user_access<R>(
        &self,
        cpu: &mut Processor,
        vaddr: usize,
        writing: bool,
        f: impl FnOnce(&mut PhysMemory, PhysAddr) -> R,
    ) -> Result<R, ExceptionCause> {
        let mut core = self.core.lock();
        let pa = cpu.translate(vaddr, writing)?;
        Ok(f(&mut core.memory, pa))
    }

    /// Harvest the TLB of `cpu` for the outgoing process `pid`.
    pub fn save_state(&self, cpu: &mut Processor, pid: Pid) -> TlbSnapshot {
        let mut core = self.core.lock();
        tlb_sync::save_state(&mut core, &mut cpu.tlb(), pid)
    }
    /// Refill the TLB of `cpu` for the incoming process `pid`.
    pub fn restore_state(&self, cpu: &mut Processor, pid: Pid, snapshot: &TlbSnapshot) -> usize {
        let mut core = self.core.lock();
        core.attach_tlb(cpu.shared_tlb());
        tlb_sync::restore_state(&core, &mut cpu.tlb(), pid, snapshot)
    }

    /// Paging counters so far
    pub fn stats(&self) -> VmStats {
        self.core.lock().stats
    }
    /// Free physical frames
    pub fn frames_free(&self) -> usize {
        self.core.lock().frames.free_count()
    }
    /// Resident pages of `pid`
    pub fn resident_pages_of(&self, pid: Pid) -> usize {
        self.core.lock().ipt.keys_of(pid).len()
    }
    /// Swap slots held by `pid`
    pub fn swap_slots_of(&self, pid: Pid) -> usize {
        let _core = self.core.lock();
        self.swap.lock().slots_of(pid)
    }
    /// `pid` still has an address space
    pub fn has_address_space(&self, pid: Pid) -> bool {
        self.core.lock().page_count(pid).is_some()
    }
    /// Log the inverted page table
    pub fn dump(&self) {
        self.core.lock().ipt.dump();
    }

    /// Check frame uniqueness, table agreement and swap slot uniqueness.
    pub fn check_invariants(&self) -> Result<(), String> {
        let core = self.core.lock();
        core.check_invariants()?;
        let swap = self.swap.lock();
        let mut seen = BTreeSet::new();
        for (key, slot) in swap.iter() {
            if !seen.insert(*slot) {
                return Err(format!("{:?} is held twice", slot));
            }
            if slot.0 >= swap.capacity() {
                return Err(format!("{:?} of {} is past the end of swap", slot, key));
            }
            if core.page_count(key.pid).is_none() {
                return Err(format!("{} holds {:?} after teardown", key, slot));
            }
        }
        Ok(())
    }

    /// Close and delete the swap file.
    pub fn shutdown(&self) {
        let _core = self.core.lock();
        let swap = self.swap.lock();
        swap.close();
        if !self.fs.remove(&self.config.swap_file) {
            warn!("vm: swap file {} already gone", self.config.swap_file);
        }
        info!(
            "vm: shut down after {} swap writes and {} swap reads",
            swap.writes(),
            swap.reads()
        );
    }
}
