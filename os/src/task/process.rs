//! Implementation of [`Process`]
//!
//! A process owns its pid, its [`AddressSpace`] and the translation
//! strategy it was created with. The kernel copy paths here move bytes
//! between kernel buffers and the process's pages one page at a time.

use alloc::{boxed::Box, string::String, sync::Arc, vec, vec::Vec};

use spin::{Mutex, MutexGuard};

use super::{pid_alloc, AddressTranslation, PidHandle, TranslationKind};
use crate::{
    config::{PAGE_SIZE, USER_WORD_SIZE},
    error::{VmError, VmResult},
    kernel::VmKernel,
    machine::{Processor, MAX_USER_ADDR},
    mm::{AddressSpace, Pid, ProgramImage, TlbSnapshot, VirtAddr},
};

/// Registers a process starts with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitialRegisters {
    /// entry point
    pub pc:   usize,
    /// top of the stack
    pub sp:   usize,
    /// number of arguments
    pub argc: usize,
    /// address of the argv array
    pub argv: usize,
}

/// Mutable part of a process
pub struct ProcessInner {
    /// TLB contents at the last switch-out
    pub tlb_snapshot: TlbSnapshot,
    /// set once the process has exited
    pub exit_code:    Option<i32>,
}

/// A user process
pub struct Process {
    /// pid, returned to the allocator when the process is dropped
    pub pid:   PidHandle,
    space:     AddressSpace,
    strategy:  Box<dyn AddressTranslation>,
    registers: InitialRegisters,
    inner:     Mutex<ProcessInner>,
}

impl Process {
    /// Create a process running `image` with arguments `args`.
    pub fn load(
        kernel: &VmKernel,
        cpu: &mut Processor,
        image: Arc<dyn ProgramImage>,
        args: &[&str],
        kind: TranslationKind,
    ) -> VmResult<Self> {
        let args_size: usize = args.iter().map(|arg| USER_WORD_SIZE + arg.len() + 1).sum();
        if args_size > PAGE_SIZE {
            return Err(VmError::ArgumentsTooLong);
        }
        let pid = pid_alloc();
        let space = AddressSpace::new(pid.0, image, kernel.config())?;
        kernel.create_address_space(pid.0, space.page_count())?;
        let strategy = kind.strategy();
        if let Err(err) = strategy.load_sections(kernel, cpu, &space) {
            kernel.destroy_address_space(pid.0)?;
            return Err(err);
        }
        let registers = InitialRegisters {
            pc:   space.image().entry_point(),
            sp:   space.initial_sp(),
            argc: args.len(),
            argv: space.arg_base(),
        };
        let process = Self {
            pid,
            space,
            strategy,
            registers,
            inner: Mutex::new(ProcessInner {
                tlb_snapshot: TlbSnapshot::default(),
                exit_code:    None,
            }),
        };
        if let Err(err) = process.write_arguments(kernel, cpu, args) {
            process.strategy.unload_sections(kernel, process.pid())?;
            return Err(err);
        }
        info!(
            "[kernel] pid {} loaded, {} pages, {:?}",
            process.pid(),
            process.space.page_count(),
            kind
        );
        Ok(process)
    }

    /// argv pointers, then the NUL-terminated strings they point to
    fn write_arguments(&self, kernel: &VmKernel, cpu: &mut Processor, args: &[&str]) -> VmResult<()> {
        if args.is_empty() {
            return Ok(());
        }
        let argv = self.registers.argv;
        let mut page = Vec::new();
        let mut string_addr = argv + args.len() * USER_WORD_SIZE;
        for arg in args {
            page.extend_from_slice(&(string_addr as u32).to_le_bytes());
            string_addr += arg.len() + 1;
        }
        for arg in args {
            page.extend_from_slice(arg.as_bytes());
            page.push(0);
        }
        let written = self
            .transfer(kernel, cpu, argv, page.len(), true, |dst, at| {
                dst.copy_from_slice(&page[at..at + dst.len()])
            })
            .map_err(|(_, err)| err)?;
        if written != page.len() {
            return Err(VmError::ArgumentsTooLong);
        }
        Ok(())
    }

    /// Process identifier
    pub fn pid(&self) -> Pid {
        self.pid.0
    }
    /// Pages of the process
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }
    /// Translation strategy
    pub fn strategy(&self) -> &dyn AddressTranslation {
        self.strategy.as_ref()
    }
    /// Registers to start the process with
    pub fn initial_registers(&self) -> InitialRegisters {
        self.registers
    }
    /// Exit status, once exited
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }
    /// Get the mutable reference of the inner part
    pub fn inner_exclusive_access(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    /// Copy between the process's pages at `vaddr` and a kernel buffer.
    ///
    /// `copy` gets each page-sized piece and its offset in the buffer. Stops
    /// early at a read-only page when writing.
    fn transfer(
        &self,
        kernel: &VmKernel,
        cpu: &mut Processor,
        vaddr: usize,
        len: usize,
        writing: bool,
        mut copy: impl FnMut(&mut [u8], usize),
    ) -> Result<usize, (usize, VmError)> {
        if vaddr > MAX_USER_ADDR {
            return Err((0, VmError::InvalidAddress(vaddr)));
        }
        let mut done = 0;
        while done < len {
            let va = VirtAddr::from(vaddr + done);
            let offset = va.page_offset();
            let n = (PAGE_SIZE - offset).min(len - done);
            let at = done;
            let copied = kernel.access_page(
                cpu,
                &self.space,
                self.strategy.as_ref(),
                va.floor(),
                writing,
                |frame| copy(&mut frame[offset..offset + n], at),
            );
            match copied {
                Ok(true) => done += n,
                Ok(false) => break,
                Err(err) => return Err((done, err)),
            }
        }
        Ok(done)
    }

    fn partial(&self, done: usize, err: VmError) -> usize {
        if err.is_kernel_fatal() {
            panic!("[kernel] pid {}: {}", self.pid(), err);
        }
        debug!("[kernel] pid {}: copy stopped after {} bytes: {}", self.pid(), done, err);
        done
    }

    /// Copy from the process's memory at `vaddr` into `data`, returning the
    /// number of bytes copied.
    pub fn read_virtual_memory(
        &self,
        kernel: &VmKernel,
        cpu: &mut Processor,
        vaddr: usize,
        data: &mut [u8],
    ) -> usize {
        let len = data.len();
        match self.transfer(kernel, cpu, vaddr, len, false, |src, at| {
            data[at..at + src.len()].copy_from_slice(src)
        }) {
            Ok(done) => done,
            Err((done, err)) => self.partial(done, err),
        }
    }

    /// Copy `data` into the process's memory at `vaddr`, returning the number
    /// of bytes copied. Stops at the first read-only page.
    pub fn write_virtual_memory(
        &self,
        kernel: &VmKernel,
        cpu: &mut Processor,
        vaddr: usize,
        data: &[u8],
    ) -> usize {
        match self.transfer(kernel, cpu, vaddr, data.len(), true, |dst, at| {
            dst.copy_from_slice(&data[at..at + dst.len()])
        }) {
            Ok(done) => done,
            Err((done, err)) => self.partial(done, err),
        }
    }

    /// Read a NUL-terminated string of at most `max_length` bytes at `vaddr`.
    pub fn read_virtual_memory_string(
        &self,
        kernel: &VmKernel,
        cpu: &mut Processor,
        vaddr: usize,
        max_length: usize,
    ) -> Option<String> {
        let mut bytes = vec![0u8; max_length + 1];
        let read = self.read_virtual_memory(kernel, cpu, vaddr, &mut bytes);
        let end = bytes[..read].iter().position(|b| *b == 0)?;
        core::str::from_utf8(&bytes[..end]).ok().map(String::from)
    }

    /// Release every page of the process and record its exit status.
    pub fn exit(&self, kernel: &VmKernel, cpu: &mut Processor, status: i32) -> VmResult<()> {
        if cpu.running() == Some(self.pid()) {
            cpu.tlb().invalidate_all();
            cpu.set_running(None);
            super::set_current(None);
        }
        {
            let mut inner = self.inner_exclusive_access();
            inner.exit_code = Some(status);
            inner.tlb_snapshot = TlbSnapshot::default();
        }
        self.strategy.unload_sections(kernel, self.pid())?;
        info!("[kernel] pid {} exited with code {}", self.pid(), status);
        Ok(())
    }
}
