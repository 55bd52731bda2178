//! Views over mapped shared memory and the buffers backing them.
//!
//! A [`Region`] is an unowned `(base, len)` view. A [`SharedBuffer`] owns the
//! memory behind a region and, when backed by a memfd, the file descriptor a
//! remote mapper needs.

use std::alloc::{self, Layout};
use std::io;
use std::os::unix::io::RawFd;
#[cfg(target_os = "linux")]
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;

#[cfg(target_endian = "big")]
compile_error!("dspq shared memory layout is little-endian only");

/// Alignment of every backing allocation.
pub const REGION_ALIGN: usize = 4096;

/// An unowned view of a shared memory region.
///
/// All accessors assert bounds and alignment. Out-of-range access is a bug in
/// the caller: values read from shared memory are validated before they are
/// used as offsets.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: Region is a view into memory that is explicitly shared between
// threads and processes. Every mutable access goes through atomics or through
// byte copies into ranges owned by exactly one writer role.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a view from a raw pointer.
    ///
    /// # Safety
    ///
    /// - `base` must point to `len` readable and writable bytes.
    /// - `base` must be at least 8-byte aligned.
    /// - The memory must stay mapped for as long as this view, or any copy of
    ///   it, is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Option<Self> {
        let base = NonNull::new(base)?;
        debug_assert_eq!(base.as_ptr() as usize % 8, 0, "region base must be 8-byte aligned");
        Some(Self { base, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// A view of `len` bytes starting at `offset`.
    pub fn subregion(&self, offset: usize, len: usize) -> Region {
        self.check(offset, len);
        Region {
            // SAFETY: bounds checked above.
            base: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) },
            len,
        }
    }

    /// The 32-bit atomic word at `offset`.
    #[inline]
    pub fn u32_at(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % 4, 0, "misaligned u32 at offset {offset}");
        self.check(offset, 4);
        // SAFETY: in bounds, aligned, and AtomicU32 has the layout of u32.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// The 64-bit atomic word at `offset`.
    #[inline]
    pub fn u64_at(&self, offset: usize) -> &AtomicU64 {
        assert_eq!(offset % 8, 0, "misaligned u64 at offset {offset}");
        self.check(offset, 8);
        // SAFETY: in bounds, aligned, and AtomicU64 has the layout of u64.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// Copy `src` into the region at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        // SAFETY: bounds checked; src cannot overlap shared memory we own.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
    }

    /// Copy bytes at `offset` out into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        // SAFETY: bounds checked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Zero `len` bytes at `offset`.
    pub fn fill_zero(&self, offset: usize, len: usize) {
        self.check(offset, len);
        // SAFETY: bounds checked.
        unsafe { std::ptr::write_bytes(self.base.as_ptr().add(offset), 0, len) }
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "region access out of bounds: offset={offset} len={len} region={}",
            self.len
        );
    }
}

enum Backing {
    /// Heap memory, for in-process use and tests.
    Heap { ptr: NonNull<u8>, layout: Layout },
    /// A memfd mapped `MAP_SHARED`, so the fd can be mapped by a remote side.
    #[cfg(target_os = "linux")]
    Memfd { fd: OwnedFd, ptr: NonNull<u8>, len: usize },
}

// SAFETY: the backing only owns the memory; access goes through Region.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Drop for Backing {
    fn drop(&mut self) {
        match self {
            Backing::Heap { ptr, layout } => {
                // SAFETY: allocated with this layout in SharedBuffer::heap.
                unsafe { alloc::dealloc(ptr.as_ptr(), *layout) }
            }
            #[cfg(target_os = "linux")]
            Backing::Memfd { ptr, len, .. } => {
                // SAFETY: mapped with this length in map_shared; fd closes on drop.
                let ret = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, *len) };
                if ret != 0 {
                    tracing::warn!("munmap failed: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

/// Owned memory backing a shared region.
///
/// Cloning is cheap and shares the same memory; the memory is released when
/// the last clone is dropped.
#[derive(Clone)]
pub struct SharedBuffer {
    backing: Arc<Backing>,
    region: Region,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.region.len())
            .field("fd", &self.fd())
            .finish()
    }
}

impl SharedBuffer {
    /// Allocate a zeroed, page-aligned heap buffer.
    pub fn heap(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer"));
        }
        let layout = Layout::from_size_align(len, REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self {
            backing: Arc::new(Backing::Heap { ptr, layout }),
            region: Region { base: ptr, len },
        })
    }

    /// Create a memfd of `len` bytes and map it shared and read/write.
    #[cfg(target_os = "linux")]
    pub fn memfd(name: &str, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer"));
        }
        let cname = std::ffi::CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))?;

        // SAFETY: cname is a valid C string.
        let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: memfd_create succeeded, we own the fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: fd is a valid memfd.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map_shared(fd, len)
    }

    /// Map an existing shared-memory fd, taking ownership of it.
    ///
    /// This is how the remote endpoint of a queue maps a buffer it received.
    #[cfg(target_os = "linux")]
    pub fn map_fd(fd: OwnedFd, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer"));
        }
        Self::map_shared(fd, len)
    }

    #[cfg(target_os = "linux")]
    fn map_shared(fd: OwnedFd, len: usize) -> io::Result<Self> {
        // SAFETY: fd is valid and at least len bytes long.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self {
            backing: Arc::new(Backing::Memfd { fd, ptr, len }),
            region: Region { base: ptr, len },
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// The file descriptor to hand to a remote mapper, if any.
    pub fn fd(&self) -> Option<RawFd> {
        match &*self.backing {
            Backing::Heap { .. } => None,
            #[cfg(target_os = "linux")]
            Backing::Memfd { fd, .. } => Some(fd.as_raw_fd()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn heap_buffer_is_zeroed_and_aligned() {
        let buf = SharedBuffer::heap(8192).unwrap();
        let region = buf.region();
        assert_eq!(region.as_ptr() as usize % REGION_ALIGN, 0);
        let mut out = [0xffu8; 64];
        region.read(4096, &mut out);
        assert!(out.iter().all(|b| *b == 0));
        assert!(buf.fd().is_none());
    }

    #[test]
    fn atomics_and_bytes_share_memory() {
        let buf = SharedBuffer::heap(64).unwrap();
        let region = buf.region();
        region.u32_at(8).store(0xdead_beef, Ordering::Release);
        let mut out = [0u8; 4];
        region.read(8, &mut out);
        assert_eq!(u32::from_le_bytes(out), 0xdead_beef);

        let sub = region.subregion(16, 16);
        sub.write(0, &7u64.to_le_bytes());
        assert_eq!(region.u64_at(16).load(Ordering::Acquire), 7);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_access_panics() {
        let buf = SharedBuffer::heap(16).unwrap();
        buf.region().write(12, &[0u8; 8]);
    }

    #[test]
    fn zero_length_rejected() {
        assert!(SharedBuffer::heap(0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn memfd_mapping_is_visible_through_second_map() {
        let buf = SharedBuffer::memfd("dspq-test", 4096).unwrap();
        let raw = buf.fd().unwrap();
        // SAFETY: dup of a valid fd.
        let dup = unsafe { libc::dup(raw) };
        assert!(dup >= 0);
        let owned = unsafe { OwnedFd::from_raw_fd(dup) };
        let peer = SharedBuffer::map_fd(owned, 4096).unwrap();

        buf.region().u32_at(100).store(42, Ordering::Release);
        assert_eq!(peer.region().u32_at(100).load(Ordering::Acquire), 42);
    }
}
