use crate::error::ShmemError;
use core::ptr::NonNull;
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::num::NonZero;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// A memfd-backed region mapped read-write into this process.
///
/// The file descriptor is what gets exported to a peer; the peer maps the same
/// pages through [`ImportedRegion`].
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: OwnedFd,
}

impl SharedMemory {
    pub fn new(size: usize) -> Result<Self, ShmemError> {
        let length = NonZero::new(size).ok_or(ShmemError::ZeroSize)?;

        let fd = memfd_create(c"handoff-plane", MFdFlags::MFD_CLOEXEC)?;
        ftruncate(&fd, size as i64)?;

        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };

        Ok(SharedMemory {
            ptr: ptr.cast(),
            size,
            fd,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn clone_fd(&self) -> Result<OwnedFd, ShmemError> {
        Ok(self.fd.try_clone()?)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

/// A read-only mapping of memory exported by another process.
pub struct ImportedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl ImportedRegion {
    /// Maps the first `len` bytes of `fd` read-only. The descriptor is closed
    /// once mapped; the mapping keeps the pages alive.
    pub fn map_readonly(fd: OwnedFd, len: usize) -> Result<Self, ShmemError> {
        let length = NonZero::new(len).ok_or(ShmemError::ZeroSize)?;

        let stat = nix::sys::stat::fstat(&fd)?;
        let available = stat.st_size.max(0) as usize;
        if available < len {
            return Err(ShmemError::RegionTooSmall {
                available,
                requested: len,
            });
        }

        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };

        Ok(ImportedRegion {
            ptr: ptr.cast(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ImportedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

unsafe impl Send for ImportedRegion {}
unsafe impl Sync for ImportedRegion {}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds `size` up to a whole number of pages.
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}
