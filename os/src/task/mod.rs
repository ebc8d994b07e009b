//! Processes, their address-translation strategies and context switching
//!
//! A [`Process`] is created with [`Process::load`], which allocates its pid,
//! creates its address space and lets the chosen [`AddressTranslation`]
//! prepare it. [`switch_to`] moves a CPU from one process to another,
//! harvesting the TLB of the outgoing one and refilling it for the incoming
//! one.

mod id;
mod process;
mod translation;

use core::sync::atomic::{AtomicIsize, Ordering};

pub use id::{pid_alloc, PidHandle, RecycleAllocator};
pub use process::{InitialRegisters, Process, ProcessInner};
pub use translation::{AddressTranslation, DemandPager, EagerLoader, TranslationKind};

use crate::{kernel::VmKernel, machine::Processor, mm::Pid};

/// pid of the process last switched to, -1 for none
static RUNNING_PID: AtomicIsize = AtomicIsize::new(-1);

/// Process running on the simulated CPU
pub fn current_pid() -> Option<Pid> {
    let pid = RUNNING_PID.load(Ordering::Relaxed);
    if pid < 0 {
        None
    } else {
        Some(pid as Pid)
    }
}

fn set_current(pid: Option<Pid>) {
    RUNNING_PID.store(pid.map_or(-1, |pid| pid as isize), Ordering::Relaxed);
}

/// Switch `cpu` from `prev` to `next`.
///
/// `prev` is `None` when nothing that still exists ran last; the TLB is
/// then invalidated without harvesting.
pub fn switch_to(kernel: &VmKernel, cpu: &mut Processor, prev: Option<&Process>, next: &Process) {
    match prev {
        Some(prev) => {
            if cpu.running() != Some(prev.pid()) {
                warn!(
                    "switch: pid {} is not running, cpu has {:?}",
                    prev.pid(),
                    cpu.running()
                );
            }
            let snapshot = kernel.save_state(cpu, prev.pid());
            prev.inner_exclusive_access().tlb_snapshot = snapshot;
        }
        None => cpu.tlb().invalidate_all(),
    }
    let snapshot = next.inner_exclusive_access().tlb_snapshot.clone();
    let restored = kernel.restore_state(cpu, next.pid(), &snapshot);
    cpu.set_running(Some(next.pid()));
    set_current(Some(next.pid()));
    trace!(
        "switch: {:?} -> {}, {} TLB slots restored",
        prev.map(|p| p.pid()),
        next.pid(),
        restored
    );
}
