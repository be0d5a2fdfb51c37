//! Operating system mapping calls
//!
//! # Safety
//!
//! All functions here perform FFI calls to libc. Callers must ensure:
//! 1. **Lifecycle**: every mapping is unmapped exactly once
//! 2. **Validity**: addresses passed to `unmap`/`msync_pages` come from `map_shared`
//! 3. **Access**: memory access respects the protection the mapping was created with

use std::fs::File;

use crate::error::{PmemError, Result};
use crate::map::Protection;

/// A shared file mapping as returned by the OS
#[derive(Debug, Clone, Copy)]
pub struct OsMapping {
    /// Page-aligned base address
    pub addr: *mut u8,
    /// Reserved length, a multiple of the page size
    pub len: usize,
    /// Whether the kernel accepted `MAP_SYNC`
    pub is_pmem: bool,
}

#[cfg(unix)]
fn prot_bits(protection: Protection) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXEC) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

#[cfg(unix)]
fn mmap_raw(
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: u64,
) -> std::io::Result<*mut u8> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| std::io::Error::from_raw_os_error(libc::EOVERFLOW))?;

    // SAFETY: FFI call to libc mmap. We pass:
    // - addr: null (OS chooses the placement)
    // - len/offset: validated by the mapping layer against the source size
    // - fd: a descriptor borrowed from a live Source
    // OS validates all parameters and returns MAP_FAILED on error.
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, fd, offset) };

    if ptr == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ptr.cast::<u8>())
    }
}

/// Map `len` bytes of `fd` at `offset`, shared.
///
/// On Linux the synchronous page-fault flag is tried first; the kernel only
/// accepts it for DAX-capable persistent memory.
#[cfg(unix)]
pub fn map_shared(len: usize, protection: Protection, file: &File, offset: u64) -> Result<OsMapping> {
    use std::os::fd::AsRawFd;

    let prot = prot_bits(protection);
    let fd = file.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        match mmap_raw(len, prot, libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC, fd, offset) {
            Ok(addr) => {
                return Ok(OsMapping {
                    addr,
                    len,
                    is_pmem: true,
                });
            }
            Err(err) if matches!(err.raw_os_error(), Some(libc::EOPNOTSUPP | libc::EINVAL)) => {
                tracing::debug!("MAP_SYNC rejected, falling back to MAP_SHARED");
            }
            Err(err) => return Err(PmemError::from_os("mmap", err)),
        }
    }

    let addr = mmap_raw(len, prot, libc::MAP_SHARED, fd, offset).map_err(|err| PmemError::from_os("mmap", err))?;
    Ok(OsMapping {
        addr,
        len,
        is_pmem: false,
    })
}

/// Release a mapping.
///
/// # Safety
///
/// `addr`/`len` must describe a mapping from [`map_shared`] that nothing
/// references any more.
#[cfg(unix)]
pub unsafe fn unmap(addr: *mut u8, len: usize) -> Result<()> {
    // SAFETY: forwarded from the caller.
    if unsafe { libc::munmap(addr.cast(), len) } != 0 {
        return Err(PmemError::from_os("munmap", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Synchronously write back the pages covering `addr..addr + len`.
///
/// The start is rounded down to a page boundary. Interrupted calls are
/// retried.
///
/// # Safety
///
/// The range must lie inside a live shared mapping.
#[cfg(unix)]
pub unsafe fn msync_pages(addr: *const u8, len: usize) -> Result<()> {
    let page = durable_system::platform::page_size();
    let start = durable_system::utils::align_down(addr as usize, page);
    let len = len + (addr as usize - start);

    loop {
        // SAFETY: forwarded from the caller; start is page aligned.
        let ret = unsafe { libc::msync(start as *mut libc::c_void, len, libc::MS_SYNC) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(PmemError::from_os("msync", err));
        }
    }
}

#[cfg(not(unix))]
pub fn map_shared(_len: usize, _protection: Protection, _file: &File, _offset: u64) -> Result<OsMapping> {
    Err(PmemError::NotSupported {
        feature: "shared file mappings",
    })
}

#[cfg(not(unix))]
pub unsafe fn unmap(_addr: *mut u8, _len: usize) -> Result<()> {
    Err(PmemError::NotSupported { feature: "munmap" })
}

#[cfg(not(unix))]
pub unsafe fn msync_pages(_addr: *const u8, _len: usize) -> Result<()> {
    Err(PmemError::NotSupported { feature: "msync" })
}
