//! Constants and machine configuration of the kernel

use alloc::string::{String, ToString};

use crate::error::{VmError, VmResult};

/// page size : 1KB
pub const PAGE_SIZE: usize = 0x400;
/// page size bits: 10
pub const PAGE_SIZE_BITS: usize = 0xa;
/// physical frames of the default machine
pub const DEFAULT_PHYS_PAGES: usize = 32;
/// hardware TLB slots of the default machine
pub const DEFAULT_TLB_SIZE: usize = 4;
/// user stack pages of every process
pub const DEFAULT_STACK_PAGES: usize = 8;
/// argument pages of every process
pub const DEFAULT_ARG_PAGES: usize = 1;
/// random samples tried before settling for a TLB-resident victim
pub const DEFAULT_VICTIM_RETRIES: usize = 4;
/// seed of the victim sampler
pub const DEFAULT_RANDOM_SEED: u64 = 0x5eed;
/// name of the swap file in the backing file system
pub const SWAP_FILE_NAME: &str = ".swap";
/// longest string the kernel reads out of user memory
pub const MAX_STRING_LENGTH: usize = 256;
/// size of a user pointer in the argument page
pub const USER_WORD_SIZE: usize = 4;

/// Parameters of the simulated machine and the paging policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// number of physical frames
    pub num_phys_pages: usize,
    /// number of hardware TLB slots
    pub tlb_size: usize,
    /// stack pages given to each process
    pub stack_pages: usize,
    /// argument pages given to each process
    pub arg_pages: usize,
    /// random victim samples before accepting a TLB-resident one
    pub victim_retries: usize,
    /// seed for victim and TLB slot selection
    pub random_seed: u64,
    /// swap file name in the backing file system
    pub swap_file: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: DEFAULT_PHYS_PAGES,
            tlb_size:       DEFAULT_TLB_SIZE,
            stack_pages:    DEFAULT_STACK_PAGES,
            arg_pages:      DEFAULT_ARG_PAGES,
            victim_retries: DEFAULT_VICTIM_RETRIES,
            random_seed:    DEFAULT_RANDOM_SEED,
            swap_file:      SWAP_FILE_NAME.to_string(),
        }
    }
}

impl MachineConfig {
    /// A default machine with `frames` physical frames and `tlb_size` TLB slots.
    pub fn with_frames(frames: usize, tlb_size: usize) -> Self {
        Self {
            num_phys_pages: frames,
            tlb_size,
            ..Self::default()
        }
    }

    /// Parse a `nachos.conf`-style file on top of the defaults.
    ///
    /// One `key = value` per line, `#` starts a comment. Keys that do not
    /// concern the virtual-memory layer are ignored.
    pub fn from_conf(text: &str) -> VmResult<Self> {
        let mut config = Self::default();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(VmError::BadConfig)?;
            config.apply(key.trim(), value.trim())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one configuration key.
    pub fn apply(&mut self, key: &str, value: &str) -> VmResult<()> {
        let number = || value.parse::<usize>().map_err(|_| VmError::BadConfig);
        match key {
            "Processor.numPhysPages" => self.num_phys_pages = number()?,
            "Processor.numTLBEntries" => self.tlb_size = number()?,
            "Processor.numStackPages" => self.stack_pages = number()?,
            "Processor.numArgPages" => self.arg_pages = number()?,
            "VM.victimRetries" => self.victim_retries = number()?,
            "Machine.randomSeed" => {
                self.random_seed = value.parse::<u64>().map_err(|_| VmError::BadConfig)?
            }
            "VM.swapFile" => self.swap_file = value.to_string(),
            _ => trace!("config: ignoring key {}", key),
        }
        Ok(())
    }

    /// Reject machines the pager cannot run on.
    pub fn validate(&self) -> VmResult<()> {
        if self.num_phys_pages == 0 || self.tlb_size == 0 || self.swap_file.is_empty() {
            return Err(VmError::BadConfig);
        }
        // the whole physical memory must stay addressable with 32-bit addresses
        let memory = self
            .num_phys_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::BadConfig)?;
        if memory > u32::MAX as usize {
            return Err(VmError::BadConfig);
        }
        Ok(())
    }
}
