//! Address-translation strategies a process is created with.
//!
//! [`DemandPager`] loads nothing up front and resolves each missing page on
//! first touch. [`EagerLoader`] loads the whole address space into pinned
//! frames at load time, after which a miss is only a lookup.

use alloc::boxed::Box;

use crate::{
    error::{VmError, VmResult},
    kernel::VmKernel,
    machine::Processor,
    mm::{AddressSpace, Pager, Pid, TranslationEntry, VirtPageNum},
};

/// Which strategy a process uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationKind {
    /// everything loaded and pinned at load time
    Eager,
    /// pages loaded on first touch, evictable
    Demand,
}

impl TranslationKind {
    /// A strategy of this kind
    pub fn strategy(self) -> Box<dyn AddressTranslation> {
        match self {
            TranslationKind::Eager => Box::new(EagerLoader),
            TranslationKind::Demand => Box::new(DemandPager),
        }
    }
}

/// How a process's pages become resident
pub trait AddressTranslation: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> TranslationKind;
    /// Prepare `space` right after its address space was created.
    fn load_sections(&self, kernel: &VmKernel, cpu: &mut Processor, space: &AddressSpace) -> VmResult<()>;
    /// Translation of `vpn`, with the table-wide lock held by `pager`.
    fn translate(
        &self,
        pager: &mut Pager<'_>,
        space: &AddressSpace,
        vpn: VirtPageNum,
    ) -> VmResult<TranslationEntry>;
    /// Release everything of `pid`.
    fn unload_sections(&self, kernel: &VmKernel, pid: Pid) -> VmResult<()> {
        kernel.destroy_address_space(pid)
    }
}

/// Load on first touch
pub struct DemandPager;

impl AddressTranslation for DemandPager {
    fn kind(&self) -> TranslationKind {
        TranslationKind::Demand
    }
    fn load_sections(&self, _kernel: &VmKernel, _cpu: &mut Processor, _space: &AddressSpace) -> VmResult<()> {
        Ok(())
    }
    fn translate(
        &self,
        pager: &mut Pager<'_>,
        space: &AddressSpace,
        vpn: VirtPageNum,
    ) -> VmResult<TranslationEntry> {
        pager.resolve(space, vpn)
    }
}

/// Load everything at once, into frames eviction leaves alone
pub struct EagerLoader;

impl AddressTranslation for EagerLoader {
    fn kind(&self) -> TranslationKind {
        TranslationKind::Eager
    }
    fn load_sections(&self, kernel: &VmKernel, cpu: &mut Processor, space: &AddressSpace) -> VmResult<()> {
        let needed = space.page_count();
        let available = kernel.config().num_phys_pages;
        if needed > available {
            warn!("eager: pid {} needs {} pages, machine has {}", space.pid(), needed, available);
            return Err(VmError::InsufficientMemory { needed, available });
        }
        kernel.with_pager(cpu.shared_tlb(), |pager| pager.preload_pinned(space))?;
        info!("eager: pid {} loaded {} pages", space.pid(), needed);
        Ok(())
    }
    fn translate(
        &self,
        pager: &mut Pager<'_>,
        space: &AddressSpace,
        vpn: VirtPageNum,
    ) -> VmResult<TranslationEntry> {
        pager.lookup_resident(space, vpn)
    }
}
