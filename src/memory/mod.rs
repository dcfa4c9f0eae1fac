//! Memory the kernel core borrows from the physical allocator: process stacks.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use crate::error::{KernelError, KernelResult};

/// A block of memory handed out by a [`MemoryManager`].
pub struct Region {
    bytes: Box<[u8]>,
}

impl Region {
    pub fn new(bytes: Box<[u8]>) -> Self {
        Region { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn base(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    /// One past the highest address of the region.
    pub fn top(&self) -> usize {
        self.base() + self.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Region({:#x}..{:#x})", self.base(), self.top())
    }
}

/// The physical memory allocator, seen from the kernel core.
pub trait MemoryManager: Send + Sync {
    fn allocate(&self, size: usize) -> KernelResult<Region>;
    fn release(&self, region: Region);
    /// Bytes currently handed out.
    fn in_use(&self) -> usize;
}

/// Allocator backed by the kernel heap, with an optional byte budget.
pub struct HeapMemory {
    budget: Option<usize>,
    used: AtomicUsize,
}

impl HeapMemory {
    pub const fn new() -> Self {
        HeapMemory { budget: None, used: AtomicUsize::new(0) }
    }

    /// Refuse allocations that would push usage past `bytes`.
    pub const fn with_budget(bytes: usize) -> Self {
        HeapMemory { budget: Some(bytes), used: AtomicUsize::new(0) }
    }
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for HeapMemory {
    fn allocate(&self, size: usize) -> KernelResult<Region> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let reserved = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            let next = used.checked_add(size)?;
            match self.budget {
                Some(limit) if next > limit => None,
                _ => Some(next),
            }
        });
        if reserved.is_err() {
            log::warn!("memory: cannot allocate {} bytes", size);
            return Err(KernelError::OutOfMemory);
        }
        Ok(Region::new(vec![0u8; size].into_boxed_slice()))
    }

    fn release(&self, region: Region) {
        self.used.fetch_sub(region.len(), Ordering::AcqRel);
    }

    fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}
