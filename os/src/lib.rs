//! The virtual-memory kernel
//!
//! Various facilities of the kernel are implemented as submodules. The most
//! important ones are:
//!
//! - [`mm`]: Frame table, inverted page table, swap store, demand pager and
//!   the TLB synchronizer
//! - [`machine`]: The simulated processor with its hardware TLB
//! - [`kernel`]: [`VmKernel`], the service object owning the shared tables
//! - [`task`]: Processes, their address-translation strategies and context
//!   switching
//! - [`trap`]: Exception dispatch and the simulated user load/store path
//!
//! An embedder creates one [`VmKernel`] per machine, loads processes with
//! [`task::Process::load`] and drives them through [`trap::user_access`] and
//! [`task::switch_to`].

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
extern crate bitflags;

#[macro_use]
pub mod console;
pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod machine;
pub mod mm;
pub mod task;
pub mod trap;

pub use config::MachineConfig;
pub use error::{VmError, VmResult};
pub use kernel::{VmKernel, VmStats};
