//! vm-sim: drive a random multi-process workload through the demand pager
//! with a real swap file on the host, checking every byte read back.

mod host_fs;

use std::{fs, path::PathBuf, str::FromStr, sync::Arc};

use clap::{App, Arg, ArgMatches};
use rand::{rngs::StdRng, Rng, SeedableRng};
use vm_kernel::{
    config::PAGE_SIZE,
    console::{self, ConsoleSink},
    logging,
    machine::Processor,
    mm::{ElfImage, ProgramImage, SectionImage, VirtPageNum},
    task::{switch_to, Process, TranslationKind},
    trap::{user_access, UserAccess},
    MachineConfig,
    VmKernel,
    VmStats,
};

use crate::host_fs::HostFileSystem;

struct Stdout;

impl ConsoleSink for Stdout {
    fn write_str(&self, s: &str) {
        print!("{}", s);
    }
}

static STDOUT: Stdout = Stdout;

/// One simulation run
struct Simulation {
    config:   MachineConfig,
    procs:    usize,
    ops:      usize,
    seed:     u64,
    swap_dir: PathBuf,
    elf:      Option<PathBuf>,
    eager:    bool,
}

fn main() {
    console::set_sink(&STDOUT);
    logging::init();
    let matches = App::new("vm-sim")
        .about("Random multi-process workload over the demand pager")
        .arg(
            Arg::with_name("conf")
                .long("conf")
                .takes_value(true)
                .help("Machine configuration in nachos.conf format"),
        )
        .arg(
            Arg::with_name("frames")
                .short("f")
                .long("frames")
                .takes_value(true)
                .help("Physical frames"),
        )
        .arg(
            Arg::with_name("tlb")
                .short("t")
                .long("tlb")
                .takes_value(true)
                .help("TLB slots"),
        )
        .arg(
            Arg::with_name("procs")
                .short("p")
                .long("procs")
                .takes_value(true)
                .help("Processes to run (default 3)"),
        )
        .arg(
            Arg::with_name("pages")
                .long("pages")
                .takes_value(true)
                .help("Stack pages of every process"),
        )
        .arg(
            Arg::with_name("ops")
                .short("n")
                .long("ops")
                .takes_value(true)
                .help("Loads and stores to issue (default 1000)"),
        )
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .takes_value(true)
                .help("Seed of the workload and of victim selection"),
        )
        .arg(
            Arg::with_name("swap-dir")
                .long("swap-dir")
                .takes_value(true)
                .help("Directory holding the swap file (default: current directory)"),
        )
        .arg(
            Arg::with_name("elf")
                .long("elf")
                .takes_value(true)
                .help("ELF executable every process runs"),
        )
        .arg(
            Arg::with_name("eager")
                .long("eager")
                .help("Load processes eagerly into pinned frames"),
        )
        .get_matches();

    let outcome = options(&matches).and_then(|sim| sim.run());
    match outcome {
        Ok(stats) => println!("{:#?}", stats),
        Err(err) => {
            eprintln!("vm-sim: {}", err);
            std::process::exit(1);
        }
    }
}

fn number<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, String> {
    match matches.value_of(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| format!("--{}: not a number: {}", name, value)),
        None => Ok(None),
    }
}

fn options(matches: &ArgMatches) -> Result<Simulation, String> {
    let mut config = match matches.value_of("conf") {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|err| format!("{}: {}", path, err))?;
            MachineConfig::from_conf(&text).map_err(|err| format!("{}: {}", path, err))?
        }
        None => MachineConfig::default(),
    };
    if let Some(frames) = number(matches, "frames")? {
        config.num_phys_pages = frames;
    }
    if let Some(tlb) = number(matches, "tlb")? {
        config.tlb_size = tlb;
    }
    if let Some(pages) = number(matches, "pages")? {
        config.stack_pages = pages;
    }
    let seed = number(matches, "seed")?.unwrap_or(config.random_seed);
    config.random_seed = seed;
    config.validate().map_err(|err| err.to_string())?;
    Ok(Simulation {
        config,
        procs: number(matches, "procs")?.unwrap_or(3),
        ops: number(matches, "ops")?.unwrap_or(1000),
        seed,
        swap_dir: matches.value_of("swap-dir").unwrap_or(".").into(),
        elf: matches.value_of("elf").map(PathBuf::from),
        eager: matches.is_present("eager"),
    })
}

/// Built-in program: two pages of code, one of data
fn builtin_image() -> SectionImage {
    let code: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i * 7) as u8).collect();
    SectionImage::new(0)
        .with_section(".text", 0, 2, true, &code)
        .with_section(".data", 2, 1, false, b"vm-sim data section")
}

/// What every page of `process` holds right after load
fn initial_contents(process: &Process) -> Vec<u8> {
    let space = process.space();
    let mut bytes = vec![0u8; space.page_count() * PAGE_SIZE];
    for (vpn, page) in bytes.chunks_mut(PAGE_SIZE).enumerate() {
        if let Some((index, section)) = space.image().section_of(VirtPageNum(vpn)) {
            space.image().load_page(index, vpn - section.first_vpn.0, page);
        }
    }
    bytes
}

impl Simulation {
    fn image(&self) -> Result<Arc<dyn ProgramImage>, String> {
        match &self.elf {
            Some(path) => {
                let data = fs::read(path).map_err(|err| format!("{}: {}", path.display(), err))?;
                let image = ElfImage::new(&data).map_err(|err| format!("{}: {}", path.display(), err))?;
                Ok(Arc::new(image))
            }
            None => Ok(Arc::new(builtin_image())),
        }
    }

    fn run(&self) -> Result<VmStats, String> {
        let fs = Arc::new(HostFileSystem::new(&self.swap_dir));
        let kernel = VmKernel::new(self.config.clone(), fs).map_err(|err| err.to_string())?;
        let result = self.workload(&kernel);
        kernel.shutdown();
        result
    }

    fn workload(&self, kernel: &VmKernel) -> Result<VmStats, String> {
        let kind = if self.eager {
            TranslationKind::Eager
        } else {
            TranslationKind::Demand
        };
        let image = self.image()?;
        let mut cpu = Processor::new(self.config.tlb_size);
        let mut procs = Vec::with_capacity(self.procs);
        for i in 0..self.procs {
            let name = format!("proc{}", i);
            let process = Process::load(kernel, &mut cpu, image.clone(), &[name.as_str()], kind)
                .map_err(|err| format!("loading process {}: {}", i, err))?;
            procs.push(process);
        }
        let mut shadow: Vec<Vec<u8>> = procs.iter().map(initial_contents).collect();
        // argv written at load
        for (process, bytes) in procs.iter().zip(shadow.iter_mut()) {
            let argv = process.initial_registers().argv;
            let len = bytes.len() - argv;
            process.read_virtual_memory(kernel, &mut cpu, argv, &mut bytes[argv..argv + len]);
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut running: Option<usize> = None;
        for op in 0..self.ops {
            let i = op % procs.len().max(1);
            let process = match procs.get(i) {
                Some(process) => process,
                None => break,
            };
            if running != Some(i) {
                switch_to(kernel, &mut cpu, running.map(|j| &procs[j]), process);
                running = Some(i);
            }
            let space = process.space();
            let end = space.page_count() * PAGE_SIZE;
            let len = rng.gen_range(1..=64usize);
            if rng.gen_bool(0.5) {
                // stores go to the stack and argument pages only
                let start = space.image_pages() * PAGE_SIZE;
                let vaddr = rng.gen_range(start..end - len);
                let data = vec![rng.gen::<u8>(); len];
                user_access(kernel, &mut cpu, process, vaddr, UserAccess::Store(&data))
                    .map_err(|cause| format!("pid {} killed by {:?} storing at {:#x}", process.pid(), cause, vaddr))?;
                shadow[i][vaddr..vaddr + len].copy_from_slice(&data);
            } else {
                let vaddr = rng.gen_range(0..end - len);
                let mut data = vec![0u8; len];
                user_access(kernel, &mut cpu, process, vaddr, UserAccess::Load(&mut data))
                    .map_err(|cause| format!("pid {} killed by {:?} loading {:#x}", process.pid(), cause, vaddr))?;
                if data[..] != shadow[i][vaddr..vaddr + len] {
                    return Err(format!("pid {} read stale bytes at {:#x}", process.pid(), vaddr));
                }
            }
        }

        for process in procs.iter() {
            process
                .exit(kernel, &mut cpu, 0)
                .map_err(|err| format!("pid {} exit: {}", process.pid(), err))?;
        }
        kernel.check_invariants()?;
        if kernel.frames_free() != self.config.num_phys_pages {
            return Err(String::from("frames leaked after every process exited"));
        }
        log::info!("vm-sim: {} operations on {} processes verified", self.ops, self.procs);
        Ok(kernel.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulation(frames: usize, eager: bool) -> Simulation {
        let dir = std::env::temp_dir().join(format!("vm-sim-run-{}-{}", std::process::id(), eager));
        fs::create_dir_all(&dir).unwrap();
        let mut config = MachineConfig::with_frames(frames, 2);
        config.stack_pages = 3;
        Simulation {
            config,
            procs: 3,
            ops: 500,
            seed: 7,
            swap_dir: dir,
            elf: None,
            eager,
        }
    }

    #[test]
    fn demand_paging_workload_verifies() {
        let sim = simulation(4, false);
        let stats = sim.run().unwrap();
        assert!(stats.evictions > 0);
        assert!(stats.swap_writes > 0);
        assert!(!sim.swap_dir.join(".swap").exists());
        fs::remove_dir_all(&sim.swap_dir).unwrap();
    }

    #[test]
    fn eager_workload_needs_room_for_everyone() {
        let sim = simulation(3 * 7, true);
        let stats = sim.run().unwrap();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.swap_writes, 0);
        fs::remove_dir_all(&sim.swap_dir).unwrap();
    }
}
