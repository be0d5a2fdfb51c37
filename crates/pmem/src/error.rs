//! Error types for the persistence layer
//!
//! Uses thiserror for the enum definitions. Errors fall into four kinds:
//! configuration (bad offsets, lengths, flags), permission (source opened
//! with too little access), hardware (the platform cannot honour the
//! durability contract) and registry (overlapping ranges). OS failures that
//! fit none of these surface as [`PmemError::Os`].

use std::io;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::FlushInstruction;
use crate::granularity::Granularity;

/// Result type for persistence operations
pub type Result<T> = std::result::Result<T, PmemError>;

// ============================================================================
// Hardware errors
// ============================================================================

/// The platform cannot provide the durability guarantees the API promises.
///
/// Raised while building the dispatch record. It is cached by the process
/// singleton, so every later initialization attempt reports the same value.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("no cache flush instruction available (clflush, clflushopt and clwb all absent)")]
    NoFlushInstruction,

    #[error("flush instruction {instruction} has no compiled variant for {target}")]
    DispatchMismatch {
        instruction: FlushInstruction,
        target: &'static str,
    },
}

impl HardwareError {
    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoFlushInstruction => "PMEM:HW:NO_FLUSH",
            Self::DispatchMismatch { .. } => "PMEM:HW:DISPATCH",
        }
    }
}

// ============================================================================
// Main error type
// ============================================================================

/// Broad category of a [`PmemError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorKind {
    /// Invalid offset, length, flag or granularity request
    Configuration,
    /// Source access mode does not allow the requested protection
    Permission,
    /// Process-fatal hardware inconsistency
    Hardware,
    /// Registry consistency violation
    Registry,
    /// Operating system failure or unsupported platform
    Platform,
}

/// Persistence layer errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PmemError {
    // --- Configuration errors ---
    #[error("offset {offset} is not aligned to {alignment} bytes")]
    OffsetUnaligned { offset: u64, alignment: usize },

    #[error("range {offset}+{length} exceeds source size {size}")]
    MapRangeExceedsSource { offset: u64, length: u64, size: u64 },

    #[error("mapping length is zero")]
    LengthZero,

    #[error("invalid protection flags: {bits:#x}")]
    InvalidProtectionFlags { bits: u32 },

    #[error("granularity {effective} is coarser than the requested maximum {requested}")]
    GranularityNotSupported {
        effective: Granularity,
        requested: Granularity,
    },

    #[error("source is not a regular file")]
    InvalidFileType,

    #[error("access {offset}+{len} out of bounds for mapping of {length} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        length: usize,
    },

    // --- Permission errors ---
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    // --- Registry errors ---
    #[error("address range {start:#x}..{end:#x} overlaps a registered mapping")]
    MappingExists { start: usize, end: usize },

    // --- Hardware errors ---
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    // --- Platform errors ---
    #[error("{operation} failed: {source}")]
    Os {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("not supported on this platform: {feature}")]
    NotSupported { feature: &'static str },
}

impl PmemError {
    /// Error category
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OffsetUnaligned { .. }
            | Self::MapRangeExceedsSource { .. }
            | Self::LengthZero
            | Self::InvalidProtectionFlags { .. }
            | Self::GranularityNotSupported { .. }
            | Self::InvalidFileType
            | Self::OutOfBounds { .. } => ErrorKind::Configuration,
            Self::PermissionDenied { .. } => ErrorKind::Permission,
            Self::MappingExists { .. } => ErrorKind::Registry,
            Self::Hardware(_) => ErrorKind::Hardware,
            Self::Os { .. } | Self::NotSupported { .. } => ErrorKind::Platform,
        }
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OffsetUnaligned { .. } => "PMEM:CONFIG:OFFSET_UNALIGNED",
            Self::MapRangeExceedsSource { .. } => "PMEM:CONFIG:RANGE",
            Self::LengthZero => "PMEM:CONFIG:LENGTH_ZERO",
            Self::InvalidProtectionFlags { .. } => "PMEM:CONFIG:PROTECTION",
            Self::GranularityNotSupported { .. } => "PMEM:CONFIG:GRANULARITY",
            Self::InvalidFileType => "PMEM:CONFIG:FILE_TYPE",
            Self::OutOfBounds { .. } => "PMEM:CONFIG:BOUNDS",
            Self::PermissionDenied { .. } => "PMEM:PERM:DENIED",
            Self::MappingExists { .. } => "PMEM:REGISTRY:EXISTS",
            Self::Hardware(err) => err.code(),
            Self::Os { .. } => "PMEM:OS:FAILED",
            Self::NotSupported { .. } => "PMEM:OS:UNSUPPORTED",
        }
    }

    /// Whether the caller may retry with weaker protection
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::Permission
    }

    // ============================================================================
    // Convenience constructors
    // ============================================================================

    /// Create a permission error
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Classify an OS error; `EACCES` and `EPERM` become permission errors
    pub fn from_os(operation: &'static str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            return Self::permission_denied(format!("{operation}: {source}"));
        }
        Self::Os { operation, source }
    }
}
