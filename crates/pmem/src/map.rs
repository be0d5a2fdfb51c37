//! Mapping assembly
//!
//! [`map`] validates a [`MapConfig`] against a [`Source`], asks the OS for a
//! shared mapping, resolves the persistence granularity and binds the
//! operation set for it. The resulting [`Mapping`] is registered in the
//! process-wide registry until it is dropped.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::{Arc, LazyLock};

use bitflags::bitflags;
use durable_system::{platform, utils};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::arch::{ArchInfo, FlushInstruction, VectorWidth};
use crate::error::{PmemError, Result};
use crate::granularity::{self, Granularity};
use crate::os::{self, OsMapping};
use crate::registry::{AddressRange, Registry};
use crate::source::Source;

bitflags! {
    /// Page protection of a mapping; empty means no access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const WRITE = 1 << 1;
        const READ = 1 << 2;
        const EXEC = 1 << 29;
    }
}

bitflags! {
    /// Hints for bulk memory operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// Skip the final drain
        const NODRAIN = 1 << 0;
        /// Prefer cache-bypassing stores
        const NONTEMPORAL = 1 << 1;
        /// Prefer cached stores
        const TEMPORAL = 1 << 2;
        /// Write-combining, same as `NONTEMPORAL`
        const WC = 1 << 3;
        /// Write-back, same as `TEMPORAL`
        const WB = 1 << 4;
        /// Do not flush; the caller persists later
        const NOFLUSH = 1 << 5;
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// What to map and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapConfig {
    /// Byte offset into the source, page aligned
    pub offset: u64,
    /// Bytes to map; `0` maps to the end of the source
    pub length: usize,
    /// Page protection
    pub protection: Protection,
    /// Coarsest granularity the caller can handle
    pub requested_max_granularity: Granularity,
}

impl MapConfig {
    /// Whole source, read-write, accepting up to `max` granularity
    #[must_use]
    pub fn new(requested_max_granularity: Granularity) -> Self {
        Self {
            offset: 0,
            length: 0,
            protection: Protection::READ | Protection::WRITE,
            requested_max_granularity,
        }
    }

    /// Set the offset
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Set the length
    #[must_use]
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Set the protection
    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    /// Set the protection from raw bits, rejecting unknown ones
    pub fn set_protection(&mut self, bits: u32) -> Result<()> {
        self.protection = Protection::from_bits(bits).ok_or(PmemError::InvalidProtectionFlags { bits })?;
        Ok(())
    }
}

// ============================================================================
// Bound operations
// ============================================================================

/// Flush step bound to a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FlushKind {
    /// Synchronous page write-back
    Msync,
    /// Cache line flush instruction
    Instruction(FlushInstruction),
    /// Nothing to do
    Empty,
}

/// Drain step bound to a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DrainKind {
    /// Store fence
    Fence,
    /// Nothing to do
    Empty,
}

/// Bulk memory family bound to a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemKind {
    /// Plain copy followed by page write-back
    Msync,
    /// Flushing kernels of the given width
    Flushing(VectorWidth),
    /// Non-flushing kernels of the given width
    Eadr(VectorWidth),
}

/// Which variants were bound, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OpsProfile {
    pub granularity: Granularity,
    pub flush: FlushKind,
    pub drain: DrainKind,
    pub mem: MemKind,
}

type RangeOp = unsafe fn(&ArchInfo, *const u8, usize);
type DrainOp = fn(&ArchInfo);
type MoveOp = unsafe fn(&ArchInfo, *mut u8, *const u8, usize, MemFlags);
type SetOp = unsafe fn(&ArchInfo, *mut u8, u8, usize, MemFlags);

/// Operation set chosen once for a mapping.
///
/// All operations are reentrant. They are `unsafe` because they take raw
/// addresses: every range must lie inside the mapping the set was bound for,
/// and writes must be permitted by its protection.
#[derive(Debug, Clone, Copy)]
pub struct BoundOps {
    arch: &'static ArchInfo,
    persist: RangeOp,
    flush: RangeOp,
    drain: DrainOp,
    memmove: MoveOp,
    memset: SetOp,
    profile: OpsProfile,
}

unsafe fn persist_pages(_arch: &ArchInfo, addr: *const u8, len: usize) {
    // SAFETY: forwarded from BoundOps callers.
    if let Err(err) = unsafe { os::msync_pages(addr, len) } {
        tracing::error!(code = err.code(), %err, "msync failed, data may not be durable");
        std::process::abort();
    }
}

fn drain_nop(_arch: &ArchInfo) {}

unsafe fn memmove_pages(arch: &ArchInfo, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe {
        std::ptr::copy(src, dst, len);
        if !flags.contains(MemFlags::NOFLUSH) {
            persist_pages(arch, dst, len);
        }
    }
}

unsafe fn memset_pages(arch: &ArchInfo, dst: *mut u8, value: u8, len: usize, flags: MemFlags) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe {
        std::ptr::write_bytes(dst, value, len);
        if !flags.contains(MemFlags::NOFLUSH) {
            persist_pages(arch, dst, len);
        }
    }
}

unsafe fn flush_lines(arch: &ArchInfo, addr: *const u8, len: usize) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe { arch.flush(addr, len) };
}

fn drain_lines(arch: &ArchInfo) {
    arch.drain();
}

unsafe fn persist_lines(arch: &ArchInfo, addr: *const u8, len: usize) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe { arch.flush(addr, len) };
    arch.drain();
}

unsafe fn memmove_lines(arch: &ArchInfo, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe { arch.memmove_nodrain(dst, src, len, flags) };
    if !flags.contains(MemFlags::NODRAIN) {
        arch.drain();
    }
}

unsafe fn memset_lines(arch: &ArchInfo, dst: *mut u8, value: u8, len: usize, flags: MemFlags) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe { arch.memset_nodrain(dst, value, len, flags) };
    if !flags.contains(MemFlags::NODRAIN) {
        arch.drain();
    }
}

unsafe fn flush_nop(_arch: &ArchInfo, _addr: *const u8, _len: usize) {}

// Under eADR the caches are durable, but streaming stores still need the
// fence to become globally visible in order.
fn drain_stores(arch: &ArchInfo) {
    arch.fence();
}

unsafe fn persist_stores(arch: &ArchInfo, _addr: *const u8, _len: usize) {
    arch.fence();
}

unsafe fn memmove_eadr(arch: &ArchInfo, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe { arch.memmove_nodrain_eadr(dst, src, len, flags) };
    if !flags.contains(MemFlags::NODRAIN) {
        arch.fence();
    }
}

unsafe fn memset_eadr(arch: &ArchInfo, dst: *mut u8, value: u8, len: usize, flags: MemFlags) {
    // SAFETY: forwarded from BoundOps callers.
    unsafe { arch.memset_nodrain_eadr(dst, value, len, flags) };
    if !flags.contains(MemFlags::NODRAIN) {
        arch.fence();
    }
}

impl BoundOps {
    /// Choose the operation set for `granularity`
    #[must_use]
    pub fn bind(arch: &'static ArchInfo, granularity: Granularity) -> Self {
        let width = arch.vector_width();
        let ops = match granularity {
            Granularity::Page => Self {
                arch,
                persist: persist_pages,
                flush: persist_pages,
                drain: drain_nop,
                memmove: memmove_pages,
                memset: memset_pages,
                profile: OpsProfile {
                    granularity,
                    flush: FlushKind::Msync,
                    drain: DrainKind::Empty,
                    mem: MemKind::Msync,
                },
            },
            Granularity::CacheLine => Self {
                arch,
                persist: persist_lines,
                flush: flush_lines,
                drain: drain_lines,
                memmove: memmove_lines,
                memset: memset_lines,
                profile: OpsProfile {
                    granularity,
                    flush: FlushKind::Instruction(arch.flush_instruction()),
                    drain: if arch.flush_has_builtin_fence() {
                        DrainKind::Empty
                    } else {
                        DrainKind::Fence
                    },
                    mem: MemKind::Flushing(width),
                },
            },
            Granularity::Byte => Self {
                arch,
                persist: persist_stores,
                flush: flush_nop,
                drain: drain_stores,
                memmove: memmove_eadr,
                memset: memset_eadr,
                profile: OpsProfile {
                    granularity,
                    flush: FlushKind::Empty,
                    drain: DrainKind::Fence,
                    mem: MemKind::Eadr(width),
                },
            },
        };
        tracing::debug!(profile = ?ops.profile, "operations bound");
        ops
    }

    /// Variants bound by [`BoundOps::bind`]
    #[must_use]
    pub fn describe(&self) -> OpsProfile {
        self.profile
    }

    /// Granularity the set was bound for
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.profile.granularity
    }

    /// Flush then drain `addr..addr + len`.
    ///
    /// # Safety
    ///
    /// The range must lie inside the mapping.
    pub unsafe fn persist(&self, addr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe { (self.persist)(self.arch, addr, len) }
    }

    /// Flush `addr..addr + len` without waiting for completion.
    ///
    /// # Safety
    ///
    /// The range must lie inside the mapping.
    pub unsafe fn flush(&self, addr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe { (self.flush)(self.arch, addr, len) }
    }

    /// Wait for prior flushes and streaming stores.
    pub fn drain(&self) {
        (self.drain)(self.arch);
    }

    /// Durable `memmove`.
    ///
    /// # Safety
    ///
    /// `dst..dst + len` must lie inside the mapping and be writable, `src`
    /// must be valid for reads of `len` bytes.
    pub unsafe fn memmove(&self, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
        if len == 0 {
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe { (self.memmove)(self.arch, dst, src, len, flags) }
    }

    /// Durable `memcpy`; overlapping ranges are handled like `memmove`.
    ///
    /// # Safety
    ///
    /// Same as [`BoundOps::memmove`].
    pub unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
        // SAFETY: forwarded from the caller.
        unsafe { self.memmove(dst, src, len, flags) }
    }

    /// Durable `memset`.
    ///
    /// # Safety
    ///
    /// `dst..dst + len` must lie inside the mapping and be writable.
    pub unsafe fn memset(&self, dst: *mut u8, value: u8, len: usize, flags: MemFlags) {
        if len == 0 {
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe { (self.memset)(self.arch, dst, value, len, flags) }
    }
}

// ============================================================================
// Mapping
// ============================================================================

pub(crate) static MAPPINGS: LazyLock<Registry<MappedRegion>> = LazyLock::new(Registry::new);

/// Shared handle to a registered mapping, as returned by [`crate::find`].
///
/// Holding one keeps the pages mapped even after the owning [`Mapping`] is
/// dropped; the region is released when the last handle goes.
pub type MappingRef = Arc<MappedRegion>;

/// A mapped region with its bound operations
pub struct MappedRegion {
    os: OsMapping,
    content_length: usize,
    granularity: Granularity,
    protection: Protection,
    ops: BoundOps,
}

// SAFETY: the raw base pointer is only dereferenced through the bound
// operations, which are reentrant; the region itself is immutable.
unsafe impl Send for MappedRegion {}
// SAFETY: see above.
unsafe impl Sync for MappedRegion {}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("address", &self.os.addr)
            .field("content_length", &self.content_length)
            .field("reserved_length", &self.os.len)
            .field("granularity", &self.granularity)
            .field("protection", &self.protection)
            .finish_non_exhaustive()
    }
}

impl AddressRange for MappedRegion {
    fn start(&self) -> usize {
        self.os.addr as usize
    }

    fn length(&self) -> usize {
        self.content_length
    }
}

impl MappedRegion {
    /// Base address, page aligned
    #[must_use]
    pub fn address(&self) -> *mut u8 {
        self.os.addr
    }

    /// Usable bytes
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Bytes reserved from the OS, at least [`MappedRegion::content_length`]
    #[must_use]
    pub fn reserved_length(&self) -> usize {
        self.os.len
    }

    /// Effective persistence granularity
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Page protection
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Bound operation set
    #[must_use]
    pub fn ops(&self) -> &BoundOps {
        &self.ops
    }

    fn check(&self, offset: usize, len: usize) -> Result<*mut u8> {
        match offset.checked_add(len) {
            Some(end) if end <= self.content_length => Ok(self.os.addr.wrapping_add(offset)),
            _ => Err(PmemError::OutOfBounds {
                offset,
                len,
                length: self.content_length,
            }),
        }
    }

    fn require(&self, needed: Protection, what: &str) -> Result<()> {
        if self.protection.contains(needed) {
            Ok(())
        } else {
            Err(PmemError::permission_denied(format!(
                "{what} needs {needed:?}, mapping has {:?}",
                self.protection
            )))
        }
    }

    /// Copy `data` to `offset` and make it durable (unless `flags` say otherwise)
    pub fn write(&self, offset: usize, data: &[u8], flags: MemFlags) -> Result<()> {
        self.require(Protection::WRITE, "write")?;
        let dst = self.check(offset, data.len())?;
        // SAFETY: bounds and write protection checked above.
        unsafe { self.ops.memcpy(dst, data.as_ptr(), data.len(), flags) };
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `value`
    pub fn fill(&self, offset: usize, value: u8, len: usize, flags: MemFlags) -> Result<()> {
        self.require(Protection::WRITE, "fill")?;
        let dst = self.check(offset, len)?;
        // SAFETY: bounds and write protection checked above.
        unsafe { self.ops.memset(dst, value, len, flags) };
        Ok(())
    }

    /// Move `len` bytes from `src` to `dst` inside the mapping
    pub fn copy_within(&self, src: usize, dst: usize, len: usize, flags: MemFlags) -> Result<()> {
        self.require(Protection::READ | Protection::WRITE, "copy")?;
        let from = self.check(src, len)?;
        let to = self.check(dst, len)?;
        // SAFETY: both ranges checked above; memmove handles overlap.
        unsafe { self.ops.memmove(to, from, len, flags) };
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.require(Protection::READ, "read")?;
        let src = self.check(offset, buf.len())?;
        // SAFETY: bounds and read protection checked above; `buf` cannot
        // alias the mapping because it is borrowed mutably.
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Make `len` bytes at `offset` durable
    pub fn persist(&self, offset: usize, len: usize) -> Result<()> {
        self.require_any()?;
        let addr = self.check(offset, len)?;
        // SAFETY: bounds checked above; the pages are accessible.
        unsafe { self.ops.persist(addr, len) };
        Ok(())
    }

    /// Flush `len` bytes at `offset` without draining
    pub fn flush(&self, offset: usize, len: usize) -> Result<()> {
        self.require_any()?;
        let addr = self.check(offset, len)?;
        // SAFETY: bounds checked above; the pages are accessible.
        unsafe { self.ops.flush(addr, len) };
        Ok(())
    }

    /// Wait for prior flushes
    pub fn drain(&self) {
        self.ops.drain();
    }

    fn require_any(&self) -> Result<()> {
        if self.protection.intersects(Protection::READ | Protection::WRITE) {
            Ok(())
        } else {
            Err(PmemError::permission_denied("flush needs an accessible mapping"))
        }
    }

    fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: the region is unregistered and this was the last handle.
        unsafe { os::unmap(this.os.addr, this.os.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unregistered before the last handle dropped.
        if let Err(err) = unsafe { os::unmap(self.os.addr, self.os.len) } {
            tracing::warn!(%err, "munmap failed");
        }
    }
}

/// Owned mapping. Dropping it unregisters the region before unmapping.
#[derive(Debug)]
pub struct Mapping {
    region: Arc<MappedRegion>,
}

impl Deref for Mapping {
    type Target = MappedRegion;

    fn deref(&self) -> &MappedRegion {
        &self.region
    }
}

impl Mapping {
    /// Unregister and unmap.
    ///
    /// If a [`MappingRef`] from [`crate::find`] is still alive the unmap is
    /// deferred until it drops, and `Ok` is returned.
    pub fn unmap(self) -> Result<()> {
        let region = Arc::clone(&self.region);
        drop(self);
        match Arc::try_unwrap(region) {
            Ok(region) => region.release(),
            Err(_shared) => {
                tracing::debug!("unmap deferred, region still referenced");
                Ok(())
            }
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        MAPPINGS.unregister(&self.region);
    }
}

/// Map `source` as described by `config`.
///
/// Initializes the dispatch record on first use, with tunables from the
/// environment.
pub fn map(config: &MapConfig, source: &Source) -> Result<Mapping> {
    let arch = crate::init()?;

    let page = platform::page_size();
    if config.offset % page as u64 != 0 {
        return Err(PmemError::OffsetUnaligned {
            offset: config.offset,
            alignment: page,
        });
    }

    let size = source.size();
    let range_error = || PmemError::MapRangeExceedsSource {
        offset: config.offset,
        length: config.length as u64,
        size,
    };
    if config.offset > size {
        return Err(range_error());
    }
    let length = if config.length == 0 {
        usize::try_from(size - config.offset).map_err(|_| range_error())?
    } else {
        config.length
    };
    if config.offset.checked_add(length as u64).is_none_or(|end| end > size) {
        return Err(range_error());
    }
    if length == 0 {
        return Err(PmemError::LengthZero);
    }

    let access = source.access();
    if config.protection.intersects(Protection::READ | Protection::EXEC) && !access.readable() {
        return Err(PmemError::permission_denied(format!(
            "{:?} requested on a source opened {access:?}",
            config.protection
        )));
    }
    if config.protection.contains(Protection::WRITE) && !access.writable() {
        return Err(PmemError::permission_denied(format!(
            "{:?} requested on a source opened {access:?}",
            config.protection
        )));
    }

    let reserved = utils::align_up(length, page).ok_or_else(range_error)?;
    let os = os::map_shared(reserved, config.protection, source.file(), config.offset)?;

    let resolved = granularity::resolve(platform::eadr_available(), os.is_pmem);
    let granularity = granularity::apply_forced(resolved, arch.force_granularity());

    let region = Arc::new(MappedRegion {
        os,
        content_length: length,
        granularity,
        protection: config.protection,
        ops: BoundOps::bind(arch, granularity),
    });

    if granularity > config.requested_max_granularity {
        return Err(PmemError::GranularityNotSupported {
            effective: granularity,
            requested: config.requested_max_granularity,
        });
    }

    MAPPINGS.register(&region)?;

    tracing::info!(
        address = format_args!("{:p}", region.address()),
        length,
        reserved,
        %granularity,
        is_pmem = os.is_pmem,
        "mapping created"
    );

    Ok(Mapping { region })
}
