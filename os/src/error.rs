//! Errors of the virtual-memory layer

use core::fmt::{self, Display, Formatter};

use crate::{machine::ExceptionCause, mm::Pid};

/// Result alias used across the kernel.
pub type VmResult<T> = Result<T, VmError>;

/// Errors reported by the paging layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// No free frame, and nothing could be evicted.
    OutOfFrames,
    /// Address is negative or outside the process's pages.
    InvalidAddress(usize),
    /// The process has no address space (never created or already destroyed).
    NoAddressSpace(Pid),
    /// `create_address_space` was called twice for the pid.
    AddressSpaceExists(Pid),
    /// An eagerly loaded image does not fit in physical memory.
    InsufficientMemory {
        /// pages the process needs
        needed:    usize,
        /// frames the machine has
        available: usize,
    },
    /// Two image sections claim the same page.
    OverlappingSections,
    /// argv does not fit in the argument page.
    ArgumentsTooLong,
    /// The program image could not be parsed.
    BadImage(&'static str),
    /// The swap file transferred fewer bytes than a page.
    SwapIo,
    /// The swap file could not be opened.
    SwapUnavailable,
    /// A configuration value is malformed or unusable.
    BadConfig,
}

impl VmError {
    /// Exception class a faulting process sees for this error.
    pub fn exception(&self) -> Option<ExceptionCause> {
        match self {
            VmError::OutOfFrames => Some(ExceptionCause::BusError),
            VmError::InvalidAddress(_) | VmError::NoAddressSpace(_) => {
                Some(ExceptionCause::AddressError)
            }
            _ => None,
        }
    }

    /// Errors the kernel cannot survive.
    pub fn is_kernel_fatal(&self) -> bool {
        matches!(self, VmError::SwapIo | VmError::SwapUnavailable)
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "out of physical frames"),
            VmError::InvalidAddress(va) => write!(f, "invalid virtual address {:#x}", va),
            VmError::NoAddressSpace(pid) => write!(f, "pid {} has no address space", pid),
            VmError::AddressSpaceExists(pid) => {
                write!(f, "pid {} already has an address space", pid)
            }
            VmError::InsufficientMemory { needed, available } => write!(
                f,
                "insufficient physical memory: {} pages needed, {} available",
                needed, available
            ),
            VmError::OverlappingSections => write!(f, "overlapping image sections"),
            VmError::ArgumentsTooLong => write!(f, "arguments too long"),
            VmError::BadImage(why) => write!(f, "bad program image: {}", why),
            VmError::SwapIo => write!(f, "short transfer on the swap file"),
            VmError::SwapUnavailable => write!(f, "swap file unavailable"),
            VmError::BadConfig => write!(f, "bad machine configuration"),
        }
    }
}
