#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unsafe_code)]
//! # Durable Pmem
//!
//! Maps files backed by persistent memory (or ordinary files) and provides
//! the primitives that make stores through the mapping durable: flush, drain,
//! persist and the bulk `memmove`/`memcpy`/`memset` family.
//!
//! The expensive decisions are made once. On first use the CPU is probed and
//! a process-wide dispatch record is built: which flush instruction is in
//! effect, whether it needs a fence, which vector width the streaming
//! kernels use and at what length they kick in. Each mapping then resolves
//! its persistence [`Granularity`] and binds a fixed [`BoundOps`] set.
//!
//! ## Example
//!
//! ```no_run
//! use std::fs::OpenOptions;
//! use durable_pmem::{Granularity, MapConfig, MemFlags, PmemError, Source};
//!
//! # fn main() -> durable_pmem::Result<()> {
//! let file = OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("/mnt/pmem/log")
//!     .map_err(|err| PmemError::from_os("open", err))?;
//! let source = Source::from_file(file)?;
//! let mapping = durable_pmem::map(&MapConfig::new(Granularity::Page), &source)?;
//!
//! mapping.write(0, b"hello", MemFlags::empty())?;
//! println!("granularity: {}", mapping.granularity());
//! # Ok(())
//! # }
//! ```
//!
//! ## Tunables
//!
//! Read once from the environment at initialization, see [`config::env`].
//! [`init_with`] installs explicit values instead.

pub mod arch;
pub mod config;
pub mod error;
pub mod granularity;
pub mod map;
pub mod os;
pub mod registry;
pub mod source;

pub use arch::{ArchInfo, Capabilities, FlushInstruction, StoreStrategy, VectorWidth};
pub use config::Tunables;
pub use error::{ErrorKind, HardwareError, PmemError, Result};
pub use granularity::Granularity;
pub use map::{
    BoundOps, DrainKind, FlushKind, MapConfig, MappedRegion, Mapping, MappingRef, MemFlags, MemKind, OpsProfile,
    Protection, map,
};
pub use source::{Access, Source};

/// Initialize the dispatch record from the environment.
///
/// Runs the probe on the first call only. A hardware error is cached, so no
/// mapping can be created later in the process.
pub fn init() -> Result<&'static ArchInfo> {
    Ok(arch::init_with(Tunables::from_env)?)
}

/// Initialize the dispatch record with explicit tunables.
///
/// Has no effect if the record already exists; the first initialization
/// wins and its record is returned.
pub fn init_with(tunables: Tunables) -> Result<&'static ArchInfo> {
    let mut supplied = Some(tunables);
    let info = arch::init_with(|| supplied.take().unwrap_or_default())?;
    if supplied.is_some() {
        tracing::debug!("dispatch record already initialized, tunables ignored");
    }
    Ok(info)
}

/// The dispatch record, if initialization already succeeded
#[must_use]
pub fn arch() -> Option<&'static ArchInfo> {
    arch::get()
}

/// Mapping whose content range contains `addr`
#[must_use]
pub fn find(addr: *const u8) -> Option<MappingRef> {
    map::MAPPINGS.find(addr as usize)
}

/// Number of live registered mappings
#[must_use]
pub fn mapping_count() -> usize {
    map::MAPPINGS.len()
}
