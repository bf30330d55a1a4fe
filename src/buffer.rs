//! Page-aligned, physically resident probe memory.
//!
//! Every sweep step owns exactly one [`ProbeBuffer`]. On Unix the region is an anonymous private
//! `mmap`, rounded up to whole pages, and each page is written once right after mapping so the
//! kernel backs it with real frames before any chain is linked through it. Dropping the buffer
//! unmaps it, so no cache or TLB state survives into the next step through reuse.
use crate::error::{ProbeError, Result};
use log::trace;
use std::ptr::NonNull;

/// Fallback when the OS won't tell us.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Size of a virtual memory page in bytes.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory-safety preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    DEFAULT_PAGE_SIZE
}

/// An owned region of raw memory used as the arena for one chain.
pub struct ProbeBuffer {
    ptr: NonNull<u8>,
    /// Bytes requested by the sweep step
    len: usize,
    /// Bytes actually reserved (whole pages)
    reserved: usize,
}

impl ProbeBuffer {
    /// Allocate and fault in a buffer of at least `size_bytes`.
    ///
    /// Fails with [`ProbeError::AllocationFailure`] when the request overflows the address space
    /// or the OS denies it.
    pub fn allocate(size_bytes: usize) -> Result<Self> {
        let page = page_size();
        let reserved = size_bytes
            .max(1)
            .checked_next_multiple_of(page)
            .ok_or(ProbeError::AllocationFailure { size_bytes })?;

        let ptr = Self::reserve(reserved).ok_or(ProbeError::AllocationFailure { size_bytes })?;

        for offset in (0..reserved).step_by(page) {
            // SAFETY: offset < reserved, the region is writable and exclusively ours
            unsafe { ptr.as_ptr().add(offset).write_volatile(0) };
        }
        trace!("allocated {size_bytes} byte probe buffer ({reserved} bytes reserved)");

        Ok(ProbeBuffer {
            ptr,
            len: size_bytes,
            reserved,
        })
    }

    #[cfg(unix)]
    fn reserve(bytes: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no file descriptor or fixed address involved
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast::<u8>())
    }

    #[cfg(not(unix))]
    fn reserve(bytes: usize) -> Option<NonNull<u8>> {
        let layout = std::alloc::Layout::from_size_align(bytes, page_size()).ok()?;
        // SAFETY: layout has non-zero size
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole `cell_size` cells in the requested region.
    pub fn cells(&self, cell_size: usize) -> usize {
        if cell_size == 0 { 0 } else { self.len / cell_size }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Flip the whole region to read + execute. Writes after this fault.
    #[cfg(unix)]
    pub(crate) fn seal_executable(&mut self) -> Result<()> {
        // SAFETY: the range is exactly the mapping created in `reserve`
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast(),
                self.reserved,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for ProbeBuffer {
    fn drop(&mut self) {
        Self::release(self.ptr, self.reserved);
    }
}

impl ProbeBuffer {
    #[cfg(unix)]
    fn release(ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: ptr/bytes describe the mapping created in `reserve`
        unsafe { libc::munmap(ptr.as_ptr().cast(), bytes) };
    }

    #[cfg(not(unix))]
    fn release(ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: same layout as in `reserve`
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(bytes, page_size());
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}
