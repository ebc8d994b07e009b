//! Memory management implementation
//!
//! Demand paging for processes whose pages outnumber the physical frames:
//! a frame table and an inverted page table shared by all processes, a
//! swap store for evicted dirty pages, the pager resolving faults, and the
//! synchronizer keeping the hardware TLB consistent with the tables.
//!
//! Every process has an [`AddressSpace`] describing its pages; the shared
//! tables live in a [`CoreMap`] owned by [`VmKernel`](crate::VmKernel).

mod address;
mod address_space;
mod core_map;
mod frame_table;
mod image;
mod inverted_page_table;
mod memory;
mod page_table;
mod pager;
mod swap;
pub mod tlb_sync;

#[cfg(test)]
mod tests_prop;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use address_space::AddressSpace;
pub use core_map::{CoreMap, VmStats};
pub use frame_table::{FrameOwner, FrameTable};
pub use image::{check_sections, ElfImage, ImageSection, ProgramImage, SectionImage};
pub use inverted_page_table::InvertedPageTable;
pub use memory::PhysMemory;
pub use page_table::{EntryFlags, PageKey, Pid, TranslationEntry};
pub use pager::Pager;
pub use swap::{MemFile, MemFileSystem, SwapFile, SwapFileSystem, SwapSlot, SwapStore};
pub use tlb_sync::TlbSnapshot;
