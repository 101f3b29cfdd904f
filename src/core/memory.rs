// This module owns the raw executable memory behind the code cache. ExecutableRegion maps a
// fixed-size anonymous region with libc::mmap and unmaps it on drop. When write/execute
// exclusivity is requested the region lives read+execute, and every write happens inside a
// ProtectScope: the scope flips the touched pages to read+write on creation and back to
// read+execute when it is dropped, so the restore runs on every exit path including early
// returns through `?`. Without exclusivity the region is mapped read+write+execute once and
// scopes are no-ops.

//! Executable memory and scoped write permission.

use super::error::{JitError, JitResult};
use std::io;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExec,
    ReadWriteExec,
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        match self {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }
}

/// Host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// A fixed-size anonymous mapping used for generated code.
pub struct ExecutableRegion {
    base: NonNull<u8>,
    size: usize,
    page_size: usize,
    wx_exclusive: bool,
}

impl ExecutableRegion {
    /// Map `size` bytes (rounded up to whole pages).
    pub fn new(size: usize, wx_exclusive: bool) -> JitResult<Self> {
        let page_size = page_size();
        let size = size.div_ceil(page_size) * page_size;
        let prot = if wx_exclusive {
            Protection::ReadExec
        } else {
            Protection::ReadWriteExec
        };

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot.to_prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::CodeAllocation {
                size,
                source: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| JitError::CodeAllocation {
            size,
            source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
        })?;

        log::debug!(
            "Mapped {} KiB of code space at {:p} (W^X: {})",
            size / 1024,
            base,
            wx_exclusive
        );

        Ok(Self {
            base,
            size,
            page_size,
            wx_exclusive,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_wx_exclusive(&self) -> bool {
        self.wx_exclusive
    }

    /// Make `[offset, offset + len)` writable until the returned scope drops.
    ///
    /// The range is widened to page boundaries.
    pub fn protect_for_write(&self, offset: usize, len: usize) -> JitResult<ProtectScope> {
        if !self.wx_exclusive || len == 0 {
            return Ok(ProtectScope::inactive());
        }
        let start = offset / self.page_size * self.page_size;
        let end = (offset + len).min(self.size).div_ceil(self.page_size) * self.page_size;
        let end = end.min(self.size);
        // SAFETY: start..end lies inside the mapping.
        let ptr = unsafe { self.base.as_ptr().add(start) };
        protect(ptr, end - start, Protection::ReadWrite).map_err(|source| {
            JitError::Protection {
                offset: start,
                len: end - start,
                source,
            }
        })?;
        Ok(ProtectScope {
            ptr,
            len: end - start,
            active: true,
        })
    }

    /// Copy `bytes` to `offset`. The range must currently be writable.
    pub(crate) fn write(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.size);
        // SAFETY: bounds checked above; the caller holds a write scope.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), bytes.len());
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        let len = len.min(self.size.saturating_sub(offset));
        // SAFETY: the mapping is always readable and the range is clamped.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: base/size come from the mmap call in `new`.
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size) };
        if rc != 0 {
            log::error!("munmap of code space failed: {}", io::Error::last_os_error());
        }
    }
}

fn protect(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    // SAFETY: callers pass page-aligned ranges inside a live mapping.
    let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, prot.to_prot()) };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Write window over part of an [`ExecutableRegion`].
///
/// Restores read+execute on drop. Must not outlive the region it came from.
#[must_use = "the range becomes executable again as soon as the scope is dropped"]
pub struct ProtectScope {
    ptr: *mut u8,
    len: usize,
    active: bool,
}

impl ProtectScope {
    fn inactive() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for ProtectScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = protect(self.ptr, self.len, Protection::ReadExec) {
            log::error!(
                "Failed to restore execute permission on {} bytes at {:p}: {}",
                self.len,
                self.ptr,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_page_rounded() {
        let region = ExecutableRegion::new(100, true).unwrap();
        assert_eq!(region.size() % region.page_size(), 0);
        assert!(region.size() >= 100);
    }

    #[test]
    fn write_inside_scope() {
        let mut region = ExecutableRegion::new(2 * page_size(), true).unwrap();
        {
            let scope = region.protect_for_write(10, 4).unwrap();
            assert!(scope.is_active());
            region.write(10, &[1, 2, 3, 4]);
        }
        assert_eq!(region.bytes(10, 4), &[1, 2, 3, 4]);
    }

    #[test]
    fn scopes_are_noops_without_exclusivity() {
        let mut region = ExecutableRegion::new(page_size(), false).unwrap();
        let scope = region.protect_for_write(0, 16).unwrap();
        assert!(!scope.is_active());
        region.write(0, &[0xC3]);
        assert_eq!(region.bytes(0, 1), &[0xC3]);
    }
}
