//! OS-backed buffers for pools that own their memory.
//!
//! The pool core is buffer-agnostic; this module supplies the common case
//! of a page-aligned anonymous mapping. Mapping is a single step (the pool
//! never grows, so there is no reserve/commit split) and the pages come
//! back zeroed on every supported platform.

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(io::Error),
    InvalidLength(usize),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM mapping failed: {e}"),
            VmError::InvalidLength(len) => write!(f, "invalid mapping length: {len}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) => Some(e),
            VmError::InvalidLength(_) => None,
        }
    }
}

/// Abstract interface for the few VM operations the crate needs.
pub(crate) trait VmOps {
    /// Map a zero-initialized readable/writable anonymous region of `len`
    /// bytes. `len` must be a non-zero page-size multiple.
    unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError>;

    /// Return a mapping obtained from [`map`](VmOps::map).
    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVm;

#[cfg(all(unix, not(any(loom, miri))))]
impl VmOps for PlatformVm {
    unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            VmError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "mmap returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn page_size() -> usize {
        use crate::sync::OnceLock;
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw).unwrap_or(4096)
        })
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
impl VmOps for PlatformVm {
    unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to VirtualAlloc.
        let ptr = unsafe {
            libc::VirtualAlloc(
                std::ptr::null_mut(),
                len,
                libc::MEM_RESERVE | libc::MEM_COMMIT,
                libc::PAGE_READWRITE,
            )
        };
        match NonNull::new(ptr as *mut u8) {
            Some(p) => Ok(p),
            None => Err(VmError::MapFailed(io::Error::last_os_error())),
        }
    }

    unsafe fn unmap(ptr: NonNull<u8>, _len: usize) -> Result<(), VmError> {
        // MEM_RELEASE requires size 0 and the base address of the region.
        // Safety: FFI call to VirtualFree.
        if unsafe { libc::VirtualFree(ptr.as_ptr() as *mut libc::c_void, 0, libc::MEM_RELEASE) }
            == 0
        {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn page_size() -> usize {
        use crate::sync::OnceLock;
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        // Safety: FFI call to GetSystemInfo.
        *PAGE_SIZE.get_or_init(|| unsafe {
            let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
            libc::GetSystemInfo(&mut info);
            info.dwPageSize as usize
        })
    }
}

// Mock backing for loom and miri runs: plain heap memory stands in for the
// mapping so the rest of the crate tests unmodified.
#[cfg(any(loom, miri))]
impl VmOps for PlatformVm {
    unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError> {
        let layout = std::alloc::Layout::from_size_align(len, 4096)
            .map_err(|_| VmError::InvalidLength(len))?;
        // Safety: layout has non-zero size (checked by PageBuffer::new).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(len, 4096)
            .map_err(|_| VmError::InvalidLength(len))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// A page-aligned, page-rounded anonymous mapping that a pool can format
/// directly. The capacity passed to [`PageBuffer::new`] is rounded up to a
/// whole number of pages and the mapping starts zeroed.
pub struct PageBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: PageBuffer exclusively owns its mapping.
unsafe impl Send for PageBuffer {}

impl PageBuffer {
    /// Map a buffer of at least `capacity` bytes.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidLength`] for a zero capacity; [`VmError::MapFailed`]
    /// if the OS refuses the mapping.
    pub fn new(capacity: usize) -> Result<Self, VmError> {
        if capacity == 0 {
            return Err(VmError::InvalidLength(capacity));
        }
        let len = capacity.next_multiple_of(PlatformVm::page_size());
        // Safety: len is a non-zero page multiple.
        let ptr = unsafe { PlatformVm::map(len)? };
        Ok(Self { ptr, len })
    }

    /// Actual mapped size (the page-rounded capacity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// OS page granularity backing these buffers.
    #[must_use]
    pub fn page_size() -> usize {
        PlatformVm::page_size()
    }
}

impl AsRef<[u8]> for PageBuffer {
    fn as_ref(&self) -> &[u8] {
        // Safety: the mapping is valid for len bytes and exclusively owned.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for PageBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety: same as as_ref, plus &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // Safety: ptr/len describe the mapping created in new().
        unsafe {
            drop(PlatformVm::unmap(self.ptr, self.len));
        }
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer").field("len", &self.len).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::arena::Pool;

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(matches!(PageBuffer::new(0), Err(VmError::InvalidLength(0))));
    }

    #[test]
    fn test_rounds_to_page_multiple() {
        let buf = PageBuffer::new(100).unwrap();
        assert_eq!(buf.len() % PageBuffer::page_size(), 0);
        assert!(buf.len() >= 100);
    }

    #[test]
    fn test_mapping_is_zeroed_and_writable() {
        let mut buf = PageBuffer::new(4096).unwrap();
        assert!(buf.as_ref().iter().all(|&b| b == 0));
        buf.as_mut()[0] = 0xA5;
        buf.as_mut()[4095] = 0x5A;
        assert_eq!(buf.as_ref()[0], 0xA5);
    }

    #[test]
    fn test_formats_as_pool() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let buf = PageBuffer::new(4096).unwrap();
        let expected_total = buf.len();
        let mut pool = Pool::format(buf).unwrap();
        assert_eq!(pool.total(), expected_total);
        let ptr = pool.alloc(100).unwrap();
        pool.payload_mut(ptr).unwrap().fill(0xEE);
        pool.erase(ptr).unwrap();
    }
}
