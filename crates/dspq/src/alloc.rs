//! Shared-buffer allocation.

use std::io;

use dspq_shm::SharedBuffer;

/// Allocates the memory behind queue regions and counter arrays.
pub trait SharedAllocator: Send + Sync {
    fn allocate(&self, name: &str, len: usize) -> io::Result<SharedBuffer>;
}

/// Heap-backed buffers. Only usable when both endpoints share the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl SharedAllocator for HeapAllocator {
    fn allocate(&self, _name: &str, len: usize) -> io::Result<SharedBuffer> {
        SharedBuffer::heap(len)
    }
}

/// memfd-backed buffers that a remote mapper can map by fd.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MemfdAllocator;

#[cfg(target_os = "linux")]
impl SharedAllocator for MemfdAllocator {
    fn allocate(&self, name: &str, len: usize) -> io::Result<SharedBuffer> {
        SharedBuffer::memfd(name, len)
    }
}

pub(crate) fn default_allocator() -> std::sync::Arc<dyn SharedAllocator> {
    #[cfg(target_os = "linux")]
    {
        std::sync::Arc::new(MemfdAllocator)
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::sync::Arc::new(HeapAllocator)
    }
}
