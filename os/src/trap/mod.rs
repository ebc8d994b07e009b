//! Trap handling functionality
//!
//! The simulated CPU raises an exception by returning its cause from
//! [`Processor::translate`]. [`user_access`] plays the part of a user load
//! or store instruction: it translates each page, hands every exception to
//! [`trap_handler`] and retries the access once the handler resolved it.
//!
//! TLB misses are resolved through the process's translation strategy.
//! Address, bus and read-only errors kill the process. Swap failures leave
//! the kernel unable to go on, so they panic.

use crate::{
    config::PAGE_SIZE,
    kernel::VmKernel,
    machine::{ExceptionCause, Processor},
    mm::{PhysAddr, PhysMemory},
    task::Process,
};

/// What the CPU does after a trap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// retry the faulting instruction
    Resume,
    /// the process was killed
    Terminate {
        /// exception that killed it
        cause:  ExceptionCause,
        /// exit status recorded
        status: i32,
    },
    /// a system call, for the syscall layer to dispatch
    Syscall,
}

/// Attempts per page before an access is given up as a bus error
const MAX_TRANSLATE_ATTEMPTS: usize = 3;

/// trap handler
pub fn trap_handler(
    kernel: &VmKernel,
    cpu: &mut Processor,
    process: &Process,
    raw_cause: u32,
) -> TrapOutcome {
    let cause = match ExceptionCause::try_from(raw_cause) {
        Ok(cause) => cause,
        Err(_) => panic!("[kernel] trap_handler: unsupport cause {}", raw_cause),
    };
    let bad_vaddr = cpu.bad_vaddr();
    match cause {
        ExceptionCause::Syscall => TrapOutcome::Syscall,
        ExceptionCause::TlbMiss | ExceptionCause::PageFault => {
            match kernel.handle_tlb_miss(cpu, process.space(), process.strategy(), bad_vaddr) {
                Ok(_) => TrapOutcome::Resume,
                Err(err) if err.is_kernel_fatal() => panic!(
                    "[kernel] trap_handler: {} resolving {:#x} of pid {}",
                    err,
                    bad_vaddr,
                    process.pid()
                ),
                Err(err) => {
                    let cause = err.exception().unwrap_or(ExceptionCause::BusError);
                    error!(
                        "[kernel] trap_handler: {} in application, bad addr = {:#x}, kernel killed it.",
                        err, bad_vaddr
                    );
                    terminate(kernel, cpu, process, cause)
                }
            }
        }
        _ => {
            error!(
                "[kernel] trap_handler: {:?} in application, bad addr = {:#x}, kernel killed it.",
                cause, bad_vaddr
            );
            terminate(kernel, cpu, process, cause)
        }
    }
}

fn terminate(
    kernel: &VmKernel,
    cpu: &mut Processor,
    process: &Process,
    cause: ExceptionCause,
) -> TrapOutcome {
    let status = -1;
    if let Err(err) = process.exit(kernel, cpu, status) {
        warn!("[kernel] pid {} exit: {}", process.pid(), err);
    }
    TrapOutcome::Terminate { cause, status }
}

/// A user-mode load into, or store from, a buffer
pub enum UserAccess<'a> {
    /// load bytes into the buffer
    Load(&'a mut [u8]),
    /// store the bytes of the buffer
    Store(&'a [u8]),
}

/// Run a user load or store of a byte range at `vaddr` for the process
/// running on `cpu`.
///
/// Returns the exception that killed the process if it did not complete.
pub fn user_access(
    kernel: &VmKernel,
    cpu: &mut Processor,
    process: &Process,
    vaddr: usize,
    mut access: UserAccess<'_>,
) -> Result<(), ExceptionCause> {
    let (len, writing) = match &access {
        UserAccess::Load(buf) => (buf.len(), false),
        UserAccess::Store(data) => (data.len(), true),
    };
    let mut done = 0;
    while done < len {
        let va = vaddr + done;
        let n = (PAGE_SIZE - va % PAGE_SIZE).min(len - done);
        access_page(kernel, cpu, process, va, writing, |memory, pa| match &mut access {
            UserAccess::Load(buf) => memory.read(pa, &mut buf[done..done + n]),
            UserAccess::Store(data) => memory.write(pa, &data[done..done + n]),
        })?;
        done += n;
    }
    Ok(())
}

/// Access one page at `vaddr`, trapping until the translation sticks.
fn access_page(
    kernel: &VmKernel,
    cpu: &mut Processor,
    process: &Process,
    vaddr: usize,
    writing: bool,
    mut f: impl FnMut(&mut PhysMemory, PhysAddr),
) -> Result<(), ExceptionCause> {
    for _ in 0..MAX_TRANSLATE_ATTEMPTS {
        let cause = match kernel.user_access(cpu, vaddr, writing, &mut f) {
            Ok(()) => return Ok(()),
            Err(cause) => cause,
        };
        match trap_handler(kernel, cpu, process, cause as u32) {
            TrapOutcome::Resume => {}
            TrapOutcome::Terminate { cause, .. } => return Err(cause),
            TrapOutcome::Syscall => return Err(ExceptionCause::Syscall),
        }
    }
    error!("[kernel] {:#x} of pid {} never translated", vaddr, process.pid());
    terminate(kernel, cpu, process, ExceptionCause::BusError);
    Err(ExceptionCause::BusError)
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        config::MachineConfig,
        mm::{MemFileSystem, ProgramImage, SectionImage, SwapFile, SwapFileSystem, VirtPageNum},
        task::{switch_to, TranslationKind},
    };

    fn kernel(frames: usize) -> VmKernel {
        VmKernel::new(MachineConfig::with_frames(frames, 2), Arc::new(MemFileSystem::new())).unwrap()
    }

    fn image() -> Arc<dyn ProgramImage> {
        Arc::new(SectionImage::new(0).with_section(".text", 0, 1, true, b"code"))
    }

    fn start(k: &VmKernel, cpu: &mut Processor, kind: TranslationKind) -> Process {
        let p = Process::load(k, cpu, image(), &[], kind).unwrap();
        switch_to(k, cpu, None, &p);
        p
    }

    #[test]
    fn dirty_bits_set_by_the_tlb_survive_eviction() {
        let k = kernel(1);
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        let va = 3 * PAGE_SIZE + 40;
        user_access(&k, &mut cpu, &p, va, UserAccess::Store(b"hello")).unwrap();
        // the page table has not heard of the write yet
        assert_eq!(k.swap_slots_of(p.pid()), 0);

        let mut other = [0xffu8; 8];
        user_access(&k, &mut cpu, &p, 4 * PAGE_SIZE, UserAccess::Load(&mut other)).unwrap();
        assert_eq!(other, [0u8; 8]);
        assert_eq!(k.swap_slots_of(p.pid()), 1);

        let mut back = [0u8; 5];
        user_access(&k, &mut cpu, &p, va, UserAccess::Load(&mut back)).unwrap();
        assert_eq!(&back, b"hello");
        let stats = k.stats();
        assert_eq!(stats.swap_writes, 1);
        assert_eq!(stats.swap_reads, 1);
        assert_eq!(stats.tlb_misses, 3);
        assert_eq!(k.check_invariants(), Ok(()));
    }

    #[test]
    fn accesses_spanning_pages_fault_each_page() {
        let k = kernel(4);
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        let data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| i as u8).collect();
        let va = PAGE_SIZE + PAGE_SIZE / 2;
        user_access(&k, &mut cpu, &p, va, UserAccess::Store(&data)).unwrap();
        let mut back = vec![0u8; data.len()];
        user_access(&k, &mut cpu, &p, va, UserAccess::Load(&mut back)).unwrap();
        assert_eq!(back, data);
        let mut code = [0u8; 4];
        user_access(&k, &mut cpu, &p, 0, UserAccess::Load(&mut code)).unwrap();
        assert_eq!(&code, b"code");
    }

    #[test]
    fn stores_to_code_kill_the_process() {
        let k = kernel(4);
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        assert_eq!(
            user_access(&k, &mut cpu, &p, 8, UserAccess::Store(b"x")),
            Err(ExceptionCause::ReadOnly)
        );
        assert_eq!(p.exit_code(), Some(-1));
        assert!(!k.has_address_space(p.pid()));
        assert_eq!(cpu.running(), None);
        assert_eq!(k.frames_free(), 4);
    }

    #[test]
    fn bad_addresses_kill_the_process() {
        let k = kernel(4);
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        let end = p.space().page_count() * PAGE_SIZE;
        let mut byte = [0u8; 1];
        assert_eq!(
            user_access(&k, &mut cpu, &p, end, UserAccess::Load(&mut byte)),
            Err(ExceptionCause::AddressError)
        );
        assert_eq!(p.exit_code(), Some(-1));

        let q = start(&k, &mut cpu, TranslationKind::Demand);
        assert_eq!(
            user_access(&k, &mut cpu, &q, 0x8000_0000, UserAccess::Load(&mut byte)),
            Err(ExceptionCause::AddressError)
        );
        assert!(!k.has_address_space(q.pid()));
    }

    #[test]
    fn no_frame_to_spare_is_a_bus_error() {
        let k = kernel(10);
        let mut cpu = Processor::new(2);
        let pinned = start(&k, &mut cpu, TranslationKind::Eager);
        let mut byte = [0u8; 1];
        user_access(&k, &mut cpu, &pinned, 0, UserAccess::Load(&mut byte)).unwrap();

        let mut other_cpu = Processor::new(2);
        let p = start(&k, &mut other_cpu, TranslationKind::Demand);
        assert_eq!(
            user_access(&k, &mut other_cpu, &p, 0, UserAccess::Load(&mut byte)),
            Err(ExceptionCause::BusError)
        );
        assert_eq!(k.check_invariants(), Ok(()));
    }

    #[test]
    fn syscalls_go_back_to_the_caller() {
        let k = kernel(4);
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        assert_eq!(
            trap_handler(&k, &mut cpu, &p, ExceptionCause::Syscall as u32),
            TrapOutcome::Syscall
        );
        assert_eq!(p.exit_code(), None);
    }

    #[test]
    #[should_panic]
    fn unknown_causes_panic() {
        let k = kernel(4);
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        trap_handler(&k, &mut cpu, &p, 42);
    }

    #[test]
    fn evictions_reach_the_tlb_of_every_cpu() {
        let k = kernel(1);
        let mut cpu_a = Processor::new(2);
        let mut cpu_b = Processor::new(2);
        let q = start(&k, &mut cpu_b, TranslationKind::Demand);
        let p = start(&k, &mut cpu_a, TranslationKind::Demand);
        let va = 2 * PAGE_SIZE;

        user_access(&k, &mut cpu_b, &q, va, UserAccess::Store(b"QQQQ")).unwrap();
        // takes the only frame away from q while cpu_b still mirrors it
        user_access(&k, &mut cpu_a, &p, va, UserAccess::Store(b"PPPP")).unwrap();
        assert_eq!(cpu_b.tlb().lookup(VirtPageNum(2)), None);
        assert_eq!(k.check_invariants(), Ok(()));

        let mut back = [0u8; 4];
        user_access(&k, &mut cpu_b, &q, va, UserAccess::Load(&mut back)).unwrap();
        assert_eq!(&back, b"QQQQ");
        user_access(&k, &mut cpu_a, &p, va, UserAccess::Load(&mut back)).unwrap();
        assert_eq!(&back, b"PPPP");
        assert_eq!(k.stats().swap_writes, 2);
        assert_eq!(k.check_invariants(), Ok(()));
    }

    struct DeadDisk;

    impl SwapFile for DeadDisk {
        fn read_at(&self, _offset: usize, _buf: &mut [u8]) -> usize {
            0
        }
        fn write_at(&self, _offset: usize, _buf: &[u8]) -> usize {
            0
        }
    }

    impl SwapFileSystem for DeadDisk {
        fn open(&self, _name: &str, _create: bool) -> Option<Arc<dyn SwapFile>> {
            Some(Arc::new(DeadDisk))
        }
        fn remove(&self, _name: &str) -> bool {
            true
        }
    }

    #[test]
    #[should_panic(expected = "short transfer on the swap file")]
    fn swap_failures_bring_the_kernel_down() {
        let k = VmKernel::new(MachineConfig::with_frames(1, 2), Arc::new(DeadDisk)).unwrap();
        let mut cpu = Processor::new(2);
        let p = start(&k, &mut cpu, TranslationKind::Demand);
        user_access(&k, &mut cpu, &p, PAGE_SIZE, UserAccess::Store(b"dirty")).unwrap();
        let mut byte = [0u8; 1];
        let _ = user_access(&k, &mut cpu, &p, 2 * PAGE_SIZE, UserAccess::Load(&mut byte));
    }
}
