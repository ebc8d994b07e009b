//! Layout of one process's virtual pages
//!
//! `[0, image)` holds the program image, then come the stack pages and the
//! argument pages. Every page in the space is backed lazily: by the image
//! section covering it, by swap once evicted dirty, or by zeros.

use alloc::sync::Arc;

use super::{check_sections, PageKey, Pid, ProgramImage, VirtAddr, VirtPageNum};
use crate::{
    config::{MachineConfig, PAGE_SIZE},
    error::{VmError, VmResult},
    machine::MAX_USER_ADDR,
};

/// Pages of one process and the image backing them
pub struct AddressSpace {
    pid:         Pid,
    image:       Arc<dyn ProgramImage>,
    image_pages: usize,
    stack_pages: usize,
    arg_pages:   usize,
}

impl AddressSpace {
    /// Lay out `image` for `pid` with the stack and argument pages of `config`.
    pub fn new(pid: Pid, image: Arc<dyn ProgramImage>, config: &MachineConfig) -> VmResult<Self> {
        check_sections(image.sections())?;
        let image_pages = image.page_count();
        let space = Self {
            pid,
            image,
            image_pages,
            stack_pages: config.stack_pages,
            arg_pages: config.arg_pages,
        };
        if space.page_count() * PAGE_SIZE > MAX_USER_ADDR {
            return Err(VmError::BadImage("address space too large"));
        }
        Ok(space)
    }
    /// Owning process
    pub fn pid(&self) -> Pid {
        self.pid
    }
    /// Program image
    pub fn image(&self) -> &dyn ProgramImage {
        self.image.as_ref()
    }
    /// Pages taken by the image
    pub fn image_pages(&self) -> usize {
        self.image_pages
    }
    /// Logical page count: image, stack and arguments
    pub fn page_count(&self) -> usize {
        self.image_pages + self.stack_pages + self.arg_pages
    }
    /// The stack grows down from the first argument page.
    pub fn initial_sp(&self) -> usize {
        (self.image_pages + self.stack_pages) * PAGE_SIZE
    }
    /// First argument page
    pub fn arg_page_vpn(&self) -> VirtPageNum {
        VirtPageNum(self.image_pages + self.stack_pages)
    }
    /// Address of the argv array
    pub fn arg_base(&self) -> usize {
        VirtAddr::from(self.arg_page_vpn()).0
    }
    /// `vpn` belongs to the space
    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        vpn.0 < self.page_count()
    }
    /// Key of one page of this space
    pub fn key(&self, vpn: VirtPageNum) -> PageKey {
        PageKey::new(self.pid, vpn)
    }
}
