//! Allocator for pids using a simple recycle strategy.

use alloc::vec::Vec;

use lazy_static::*;
use spin::Mutex;

use crate::mm::Pid;

/// Allocator with a simple recycle strategy
pub struct RecycleAllocator {
    current:  usize,
    recycled: Vec<usize>,
}

impl RecycleAllocator {
    /// Create a new allocator
    pub fn new() -> Self {
        RecycleAllocator {
            current:  0,
            recycled: Vec::new(),
        }
    }
    /// allocate a new id
    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }
    /// give an id back
    pub fn dealloc(&mut self, id: usize) {
        assert!(id < self.current);
        assert!(
            !self.recycled.iter().any(|i| *i == id),
            "id {} has been deallocated!",
            id
        );
        self.recycled.push(id);
    }
}

lazy_static! {
    /// Global allocator for pid
    static ref PID_ALLOCATOR: Mutex<RecycleAllocator> = Mutex::new(RecycleAllocator::new());
}

/// A handle to a pid, returned to the allocator on drop
#[derive(Debug)]
pub struct PidHandle(pub Pid);

/// Allocate a pid for a process
pub fn pid_alloc() -> PidHandle {
    PidHandle(PID_ALLOCATOR.lock().alloc())
}

impl Drop for PidHandle {
    fn drop(&mut self) {
        trace!("drop pid {}", self.0);
        PID_ALLOCATOR.lock().dealloc(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_ids_come_back_first() {
        let mut ids = RecycleAllocator::new();
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 1);
        ids.dealloc(0);
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 2);
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut ids = RecycleAllocator::new();
        let id = ids.alloc();
        ids.dealloc(id);
        ids.dealloc(id);
    }

    #[test]
    fn live_handles_are_distinct() {
        let a = pid_alloc();
        let b = pid_alloc();
        assert_ne!(a.0, b.0);
    }
}
