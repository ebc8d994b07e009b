//! The simulated machine the VM layer runs on.
//!
//! Only what paging needs is modeled: a [`Processor`] with its hardware
//! [`Tlb`], the bad-vaddr and cause registers, and the address translation
//! the MMU performs on every user load and store.
//!
//! Each TLB sits behind its own lock so the kernel can shoot entries down
//! from another CPU. Whoever needs both takes the table-wide lock first.

mod tlb;

use alloc::sync::Arc;

use num_enum::TryFromPrimitive;
use spin::{Mutex, MutexGuard};
pub use tlb::{SharedTlb, Tlb};

use crate::mm::{PhysAddr, Pid, VirtAddr};

/// Exception causes, as stored in the cause register
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ExceptionCause {
    /// a system call
    Syscall            = 0,
    /// no valid translation
    PageFault          = 1,
    /// no TLB slot holds the page
    TlbMiss            = 2,
    /// write to a read-only page
    ReadOnly           = 3,
    /// no physical memory to back the access
    BusError           = 4,
    /// address outside the address space
    AddressError       = 5,
    /// integer overflow
    Overflow           = 6,
    /// instruction could not be decoded
    IllegalInstruction = 7,
}

/// Highest user address; anything above is negative to the 32-bit machine.
pub const MAX_USER_ADDR: usize = i32::MAX as usize;

/// One CPU
pub struct Processor {
    tlb:       SharedTlb,
    running:   Option<Pid>,
    bad_vaddr: usize,
    cause:     u32,
}

impl Processor {
    /// A processor with `tlb_size` TLB slots and nothing running
    pub fn new(tlb_size: usize) -> Self {
        Self {
            tlb:       Arc::new(Mutex::new(Tlb::new(tlb_size))),
            running:   None,
            bad_vaddr: 0,
            cause:     0,
        }
    }
    /// Hardware TLB of this CPU
    pub fn tlb(&self) -> MutexGuard<'_, Tlb> {
        self.tlb.lock()
    }
    /// The TLB as the kernel registers it for shootdowns
    pub fn shared_tlb(&self) -> &SharedTlb {
        &self.tlb
    }
    /// Process whose translations the TLB holds
    pub fn running(&self) -> Option<Pid> {
        self.running
    }
    /// Record the process now running.
    pub fn set_running(&mut self, pid: Option<Pid>) {
        self.running = pid;
    }
    /// Faulting address of the last exception
    pub fn bad_vaddr(&self) -> usize {
        self.bad_vaddr
    }
    /// Raw cause register
    pub fn cause(&self) -> u32 {
        self.cause
    }

    fn raise(&mut self, cause: ExceptionCause, vaddr: usize) -> ExceptionCause {
        self.cause = cause as u32;
        self.bad_vaddr = vaddr;
        cause
    }

    /// Translate `vaddr` through the TLB like the MMU would.
    ///
    /// On success the TLB copy of the entry gets its referenced bit, and its
    /// dirty bit when `writing`.
    pub fn translate(&mut self, vaddr: usize, writing: bool) -> Result<PhysAddr, ExceptionCause> {
        if vaddr > MAX_USER_ADDR {
            return Err(self.raise(ExceptionCause::AddressError, vaddr));
        }
        let va = VirtAddr::from(vaddr);
        let result = {
            let mut tlb = self.tlb.lock();
            match tlb.lookup(va.floor()) {
                None => Err(ExceptionCause::TlbMiss),
                Some(index) => {
                    let entry = tlb.entry_mut(index);
                    if writing && entry.read_only() {
                        Err(ExceptionCause::ReadOnly)
                    } else if let Some(ppn) = entry.ppn {
                        entry.touch(writing);
                        Ok(ppn.addr(va.page_offset()))
                    } else {
                        Err(ExceptionCause::BusError)
                    }
                }
            }
        };
        result.map_err(|cause| self.raise(cause, vaddr))
    }
}
