//! Mapping source: an open regular file with its size and access mode

use std::fs::File;

use crate::error::{PmemError, Result};

/// Access mode the source was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `O_RDONLY`
    ReadOnly,
    /// `O_WRONLY`
    WriteOnly,
    /// `O_RDWR`
    ReadWrite,
}

impl Access {
    /// Whether pages may be mapped readable
    #[must_use]
    pub fn readable(self) -> bool {
        self != Self::WriteOnly
    }

    /// Whether pages may be mapped writable (shared mappings need read too)
    #[must_use]
    pub fn writable(self) -> bool {
        self == Self::ReadWrite
    }
}

/// File to be mapped
#[derive(Debug)]
pub struct Source {
    file: File,
    size: u64,
    access: Access,
}

impl Source {
    /// Wrap an open file.
    ///
    /// Fails with [`PmemError::InvalidFileType`] for anything but a regular
    /// file.
    pub fn from_file(file: File) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|err| PmemError::from_os("fstat", err))?;
        if !metadata.is_file() {
            return Err(PmemError::InvalidFileType);
        }

        let access = access_mode(&file)?;
        Ok(Self {
            size: metadata.len(),
            access,
            file,
        })
    }

    /// Size in bytes at the time the source was created
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Access mode of the underlying descriptor
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Underlying file
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(unix)]
fn access_mode(file: &File) -> Result<Access> {
    use std::os::fd::AsRawFd;

    // SAFETY: F_GETFL only reads descriptor flags of a descriptor we own.
    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(PmemError::from_os("fcntl", std::io::Error::last_os_error()));
    }

    Ok(match flags & libc::O_ACCMODE {
        libc::O_RDONLY => Access::ReadOnly,
        libc::O_WRONLY => Access::WriteOnly,
        _ => Access::ReadWrite,
    })
}

#[cfg(not(unix))]
fn access_mode(_file: &File) -> Result<Access> {
    Err(PmemError::NotSupported {
        feature: "file access mode query",
    })
}
