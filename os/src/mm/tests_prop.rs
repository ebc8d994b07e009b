#![cfg(test)]
//! Property tests: random workloads on small machines keep the frame table,
//! the inverted page table and swap consistent, and every byte where the
//! process put it.

use alloc::{sync::Arc, vec, vec::Vec};

use proptest::prelude::*;

use crate::{
    config::{MachineConfig, PAGE_SIZE},
    kernel::VmKernel,
    machine::Processor,
    mm::{MemFileSystem, ProgramImage, SectionImage},
    task::{switch_to, Process, TranslationKind},
    trap::{user_access, UserAccess},
};

/// code, data, two stack pages, one argument page
const PAGES: usize = 5;

#[derive(Clone, Copy, Debug)]
enum Access {
    CopyWrite,
    CopyRead,
    UserStore,
    UserLoad,
}

#[derive(Clone, Copy, Debug)]
struct Op {
    proc:   usize,
    vaddr:  usize,
    len:    usize,
    byte:   u8,
    access: Access,
}

fn arb_op(procs: usize) -> impl Strategy<Value = Op> {
    let access = prop_oneof![
        Just(Access::CopyWrite),
        Just(Access::CopyRead),
        Just(Access::UserStore),
        Just(Access::UserLoad),
    ];
    (0..procs, 0..PAGES * PAGE_SIZE, 1usize..(2 * PAGE_SIZE), any::<u8>(), access).prop_map(
        |(proc, vaddr, len, byte, access)| {
            let writing = matches!(access, Access::CopyWrite | Access::UserStore);
            // the code page is read-only
            let vaddr = if writing { vaddr.max(PAGE_SIZE) } else { vaddr };
            Op {
                proc,
                vaddr,
                len: len.min(PAGES * PAGE_SIZE - vaddr),
                byte,
                access,
            }
        },
    )
}

fn contents() -> Vec<u8> {
    let mut bytes = vec![0u8; PAGES * PAGE_SIZE];
    bytes[..PAGE_SIZE].fill(0x42);
    for (i, b) in bytes[PAGE_SIZE..2 * PAGE_SIZE].iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    bytes
}

fn image() -> Arc<dyn ProgramImage> {
    let bytes = contents();
    Arc::new(
        SectionImage::new(0)
            .with_section(".text", 0, 1, true, &bytes[..PAGE_SIZE])
            .with_section(".data", 1, 1, false, &bytes[PAGE_SIZE..2 * PAGE_SIZE]),
    )
}

fn machine(frames: usize, tlb: usize, seed: u64) -> VmKernel {
    let mut config = MachineConfig::with_frames(frames, tlb);
    config.stack_pages = 2;
    config.random_seed = seed;
    VmKernel::new(config, Arc::new(MemFileSystem::new())).unwrap()
}

/// Run `ops` against `procs`, checking reads and invariants against a
/// shadow copy of every process's memory.
fn run(k: &VmKernel, cpu: &mut Processor, procs: &[Process], shadow: &mut [Vec<u8>], ops: &[Op]) -> Result<(), TestCaseError> {
    let mut running: Option<usize> = None;
    for op in ops {
        let p = &procs[op.proc];
        let range = op.vaddr..op.vaddr + op.len;
        if matches!(op.access, Access::UserStore | Access::UserLoad) && running != Some(op.proc) {
            switch_to(k, cpu, running.map(|i| &procs[i]), p);
            running = Some(op.proc);
        }
        match op.access {
            Access::CopyWrite => {
                let data = vec![op.byte; op.len];
                prop_assert_eq!(p.write_virtual_memory(k, cpu, op.vaddr, &data), op.len);
                shadow[op.proc][range].fill(op.byte);
            }
            Access::UserStore => {
                let data = vec![op.byte; op.len];
                prop_assert_eq!(user_access(k, cpu, p, op.vaddr, UserAccess::Store(&data)), Ok(()));
                shadow[op.proc][range].fill(op.byte);
            }
            Access::CopyRead => {
                let mut back = vec![0u8; op.len];
                prop_assert_eq!(p.read_virtual_memory(k, cpu, op.vaddr, &mut back), op.len);
                prop_assert_eq!(&back[..], &shadow[op.proc][range]);
            }
            Access::UserLoad => {
                let mut back = vec![0u8; op.len];
                prop_assert_eq!(user_access(k, cpu, p, op.vaddr, UserAccess::Load(&mut back)), Ok(()));
                prop_assert_eq!(&back[..], &shadow[op.proc][range]);
            }
        }
        prop_assert_eq!(k.check_invariants(), Ok(()));
    }
    for (i, p) in procs.iter().enumerate() {
        let mut all = vec![0u8; PAGES * PAGE_SIZE];
        prop_assert_eq!(p.read_virtual_memory(k, cpu, 0, &mut all), all.len());
        prop_assert_eq!(&all, &shadow[i]);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_workloads_keep_every_byte(
        frames in 1usize..6,
        tlb in 1usize..4,
        seed in any::<u64>(),
        ops in prop::collection::vec(arb_op(3), 1..40),
    ) {
        let k = machine(frames, tlb, seed);
        let mut cpu = Processor::new(tlb);
        let procs: Vec<Process> = (0..3)
            .map(|_| Process::load(&k, &mut cpu, image(), &[], TranslationKind::Demand).unwrap())
            .collect();
        let mut shadow = vec![contents(); 3];
        run(&k, &mut cpu, &procs, &mut shadow, &ops)?;

        for p in procs.iter() {
            p.exit(&k, &mut cpu, 0).unwrap();
            prop_assert_eq!(k.swap_slots_of(p.pid()), 0);
        }
        prop_assert_eq!(k.frames_free(), frames);
        prop_assert_eq!(k.check_invariants(), Ok(()));
    }

    #[test]
    fn pinned_pages_stay_put(
        extra in 1usize..4,
        seed in any::<u64>(),
        ops in prop::collection::vec(arb_op(2), 1..40),
    ) {
        let k = machine(PAGES + extra, 2, seed);
        let mut cpu = Processor::new(2);
        let procs = [
            Process::load(&k, &mut cpu, image(), &[], TranslationKind::Eager).unwrap(),
            Process::load(&k, &mut cpu, image(), &[], TranslationKind::Demand).unwrap(),
        ];
        let mut shadow = vec![contents(); 2];
        run(&k, &mut cpu, &procs, &mut shadow, &ops)?;
        prop_assert_eq!(k.resident_pages_of(procs[0].pid()), PAGES);
        prop_assert_eq!(k.swap_slots_of(procs[0].pid()), 0);
    }
}
