//! Backing object creation and the fixed-address mapping.
//!
//! The region lives in an anonymous memory object (`memfd_create`, with a
//! `shm_open` fallback on macOS) or, when a backing directory is supplied,
//! in an unlinked temp file there. Every process maps it `MAP_SHARED` at
//! [`BASE_ADDR`](super::layout::BASE_ADDR) so the raw addresses stored in
//! the region stay valid across the fork tree.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::error::{Error, Result};

use super::layout::{RegionLayout, BASE_ADDR};

#[cfg(target_os = "linux")]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
// Absent (and implicit) elsewhere.
#[cfg(not(target_os = "linux"))]
const MAP_NORESERVE: libc::c_int = 0;

/// The mapped region. Owns the backing descriptor; the mapping is torn
/// down on drop, so a process holds at most one live region at a time.
pub struct ShmRegion {
    base: *mut u8,
    layout: RegionLayout,
    fd: OwnedFd,
}

impl ShmRegion {
    /// Master side: create the backing object sized to `layout` and map it.
    pub fn create(
        layout: RegionLayout,
        shm_dir: Option<&Path>,
        minimum_avail: u64,
    ) -> Result<ShmRegion> {
        let fd = match shm_dir {
            None => anonymous_backing()?,
            Some(dir) => {
                assert_avail_exceeds_minimum(dir, minimum_avail)?;
                // An unlinked temp file: the name disappears immediately,
                // the data lives until the last descriptor closes.
                let file = tempfile::tempfile_in(dir)?;
                OwnedFd::from(file)
            }
        };
        clear_cloexec(fd.as_raw_fd())?;

        if unsafe { libc::ftruncate(fd.as_raw_fd(), layout.total_size() as libc::off_t) } == -1 {
            return Err(io::Error::last_os_error().into());
        }

        Self::map(fd, layout)
    }

    /// Worker side: map the object the master created. Takes ownership of
    /// the descriptor inherited across the fork.
    pub fn attach(fd: RawFd, layout: RegionLayout) -> Result<ShmRegion> {
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::map(fd, layout)
    }

    fn map(fd: OwnedFd, layout: RegionLayout) -> Result<ShmRegion> {
        // MAP_NORESERVE because the region is sized far beyond what most
        // runs commit; pages are committed explicitly via `reserve`.
        let base = unsafe {
            libc::mmap(
                BASE_ADDR as *mut libc::c_void,
                layout.total_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | MAP_NORESERVE | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        debug_assert_eq!(base as usize, BASE_ADDR);

        // The region dwarfs everything else in a core file and holds no
        // stacks; keep it out of dumps.
        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(base, layout.total_size(), libc::MADV_DONTDUMP);
        }

        Ok(ShmRegion {
            base: base as *mut u8,
            layout,
            fd,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn backing_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Pointer to the byte at `offset` from the region base.
    ///
    /// # Safety
    /// `offset` must lie within the mapped region.
    pub unsafe fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.layout.total_size());
        self.base.add(offset)
    }

    /// Force the range `[ptr, ptr + len)` to be committed, so running out
    /// of memory surfaces as [`Error::OutOfSharedMemory`] here instead of
    /// a `SIGBUS` at first touch. No-op on macOS, whose shm objects do not
    /// support preallocation.
    pub fn reserve(&self, ptr: *mut u8, len: usize) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let offset = ptr as usize - self.base as usize;
            let rc = unsafe {
                libc::posix_fallocate(
                    self.fd.as_raw_fd(),
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            };
            if rc != 0 {
                return Err(Error::OutOfSharedMemory);
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (ptr, len);
        }
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.layout.total_size());
        }
    }
}

/// Create an anonymous memory object with an inheritable descriptor.
fn anonymous_backing() -> Result<OwnedFd> {
    #[cfg(target_os = "linux")]
    {
        let name = CString::new("depot_heap").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        if fd >= 0 {
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }
    #[cfg(target_os = "macos")]
    {
        // ftruncate on a reused shm name fails with EINVAL; unlink any
        // leftover object from a previous process with our pid first.
        let name = CString::new(format!("/depot_heap.{}", unsafe { libc::getpid() })).unwrap();
        unsafe { libc::shm_unlink(name.as_ptr()) };
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        unsafe { libc::shm_unlink(name.as_ptr()) };
        if fd >= 0 {
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }
    Err(Error::FailedAnonymousInit)
}

/// Descriptors must survive an exec in spawned workers, not just a fork.
fn clear_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Refuse to build the region in a backing directory that is nearly full.
fn assert_avail_exceeds_minimum(dir: &Path, minimum_avail: u64) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_dir = CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "backing directory path contains NUL",
        ))
    })?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_dir.as_ptr(), &mut stats) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let avail = stats.f_bsize as u64 * stats.f_bavail as u64;
    if avail < minimum_avail {
        return Err(Error::LessThanMinimumAvailable(avail));
    }
    Ok(())
}
