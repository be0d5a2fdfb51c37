//! Hardware dispatch
//!
//! [`ArchInfo`] is built once per process from the probed [`Capabilities`]
//! and the [`Tunables`]. It holds the flush and fence functions in effect and
//! the kernel tables every mapping binds its operations from. Nothing in it
//! changes after initialization.
//!
//! The fence is always a store fence. A serialized flush (CLFLUSH) makes it
//! redundant after flushes only, which [`ArchInfo::drain`] accounts for;
//! streaming stores are fenced regardless.

use std::fmt;
use std::sync::OnceLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::Tunables;
use crate::error::HardwareError;
use crate::granularity::Granularity;
use crate::map::MemFlags;

#[cfg(target_arch = "x86_64")]
pub(crate) mod flush;
pub(crate) mod memops;
pub mod probe;

pub use probe::Capabilities;

/// Cache flush instruction in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FlushInstruction {
    /// Serialized flush-and-invalidate
    Clflush,
    /// Weakly ordered flush-and-invalidate
    Clflushopt,
    /// Weakly ordered write-back
    Clwb,
}

impl FlushInstruction {
    /// Whether the instruction completes before later stores, making the
    /// drain fence redundant.
    #[must_use]
    pub fn has_builtin_fence(self) -> bool {
        self == Self::Clflush
    }

    /// Mnemonic
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clflush => "clflush",
            Self::Clflushopt => "clflushopt",
            Self::Clwb => "clwb",
        }
    }
}

impl fmt::Display for FlushInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vector width used by the non-temporal kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VectorWidth {
    /// No streaming stores; every copy is temporal
    Generic,
    /// 128-bit
    Sse2,
    /// 256-bit
    Avx,
    /// 512-bit
    Avx512f,
}

/// How a single bulk operation stores its bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStrategy {
    /// Plain copy, the caller flushes
    Passthrough,
    /// Cached stores, then flush
    Temporal,
    /// Cache-bypassing stores
    NonTemporal,
}

/// Pick the store strategy for a flushing copy.
///
/// Hints win over length; without hints, lengths below `threshold` are
/// copied with temporal stores.
#[must_use]
pub fn select_store(flags: MemFlags, len: usize, threshold: usize) -> StoreStrategy {
    if flags.contains(MemFlags::NOFLUSH) {
        StoreStrategy::Passthrough
    } else if flags.intersects(MemFlags::NONTEMPORAL | MemFlags::WC) {
        StoreStrategy::NonTemporal
    } else if flags.intersects(MemFlags::TEMPORAL | MemFlags::WB) {
        StoreStrategy::Temporal
    } else if len < threshold {
        StoreStrategy::Temporal
    } else {
        StoreStrategy::NonTemporal
    }
}

/// Pick the store strategy when caches are persistent.
///
/// Nothing is flushed; streaming stores are used only when asked for.
#[must_use]
pub fn select_store_eadr(flags: MemFlags) -> StoreStrategy {
    if flags.intersects(MemFlags::NONTEMPORAL | MemFlags::WC) {
        StoreStrategy::NonTemporal
    } else {
        StoreStrategy::Temporal
    }
}

// ============================================================================
// Kernel tables
// ============================================================================

/// Move kernel: `(dst, src, len)`
pub type MoveFn = unsafe fn(*mut u8, *const u8, usize);
/// Set kernel: `(dst, value, len)`
pub type SetFn = unsafe fn(*mut u8, u8, usize);
/// Flush: `(addr, len)`
pub type FlushFn = unsafe fn(*const u8, usize);
/// Fence
pub type FenceFn = fn();

/// Move kernels for one (width, flusher) pair
#[derive(Debug, Clone, Copy)]
pub struct MoveKernels {
    temporal: MoveFn,
    nontemporal: MoveFn,
    passthrough: MoveFn,
}

/// Set kernels for one (width, flusher) pair
#[derive(Debug, Clone, Copy)]
pub struct SetKernels {
    temporal: SetFn,
    nontemporal: SetFn,
    passthrough: SetFn,
}

impl MoveKernels {
    fn pick(&self, strategy: StoreStrategy) -> MoveFn {
        match strategy {
            StoreStrategy::Passthrough => self.passthrough,
            StoreStrategy::Temporal => self.temporal,
            StoreStrategy::NonTemporal => self.nontemporal,
        }
    }
}

impl SetKernels {
    fn pick(&self, strategy: StoreStrategy) -> SetFn {
        match strategy {
            StoreStrategy::Passthrough => self.passthrough,
            StoreStrategy::Temporal => self.temporal,
            StoreStrategy::NonTemporal => self.nontemporal,
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod table {
    use super::memops::{
        Avx, Avx512f, Flusher, Sse2, move_nontemporal, move_passthrough, move_temporal,
        set_nontemporal, set_passthrough, set_temporal,
    };
    use super::{MoveFn, MoveKernels, SetFn, SetKernels, VectorWidth};

    pub(super) fn move_kernels<F: Flusher>(width: VectorWidth) -> MoveKernels {
        let nontemporal: MoveFn = match width {
            VectorWidth::Generic => move_temporal::<F>,
            VectorWidth::Sse2 => move_nontemporal::<F, Sse2>,
            VectorWidth::Avx => move_nontemporal::<F, Avx>,
            VectorWidth::Avx512f => move_nontemporal::<F, Avx512f>,
        };
        MoveKernels {
            temporal: move_temporal::<F>,
            nontemporal,
            passthrough: move_passthrough,
        }
    }

    pub(super) fn set_kernels<F: Flusher>(width: VectorWidth) -> SetKernels {
        let nontemporal: SetFn = match width {
            VectorWidth::Generic => set_temporal::<F>,
            VectorWidth::Sse2 => set_nontemporal::<F, Sse2>,
            VectorWidth::Avx => set_nontemporal::<F, Avx>,
            VectorWidth::Avx512f => set_nontemporal::<F, Avx512f>,
        };
        SetKernels {
            temporal: set_temporal::<F>,
            nontemporal,
            passthrough: set_passthrough,
        }
    }
}

// ============================================================================
// Dispatch record
// ============================================================================

/// Process-wide dispatch record
#[derive(Debug, Clone, Copy)]
pub struct ArchInfo {
    flush_instruction: FlushInstruction,
    flush: FlushFn,
    fence: FenceFn,
    width: VectorWidth,
    movnt_threshold: usize,
    force_granularity: Option<Granularity>,
    memmove: MoveKernels,
    memset: SetKernels,
    memmove_eadr: MoveKernels,
    memset_eadr: SetKernels,
}

impl ArchInfo {
    /// Build the record for the given capabilities.
    ///
    /// Fails when no flush instruction exists or when the instruction has no
    /// compiled variant for this target.
    #[cfg(target_arch = "x86_64")]
    pub fn build(caps: &Capabilities, tunables: &Tunables) -> Result<Self, HardwareError> {
        use flush::{Clflush, Clflushopt, Clwb, sfence};
        use memops::{Flusher, NoFlush};
        use table::{move_kernels, set_kernels};

        let instruction = caps.flush.ok_or(HardwareError::NoFlushInstruction)?;
        let width = caps.width;

        let flush: FlushFn = match instruction {
            FlushInstruction::Clflush => Clflush::flush_range,
            FlushInstruction::Clflushopt => Clflushopt::flush_range,
            FlushInstruction::Clwb => Clwb::flush_range,
        };
        let (memmove, memset) = match instruction {
            FlushInstruction::Clflush => (move_kernels::<Clflush>(width), set_kernels::<Clflush>(width)),
            FlushInstruction::Clflushopt => (
                move_kernels::<Clflushopt>(width),
                set_kernels::<Clflushopt>(width),
            ),
            FlushInstruction::Clwb => (move_kernels::<Clwb>(width), set_kernels::<Clwb>(width)),
        };

        let info = Self {
            flush_instruction: instruction,
            flush,
            fence: sfence,
            width,
            movnt_threshold: tunables.movnt_threshold,
            force_granularity: tunables.force_granularity,
            memmove,
            memset,
            memmove_eadr: move_kernels::<NoFlush>(width),
            memset_eadr: set_kernels::<NoFlush>(width),
        };

        tracing::debug!(
            flush = %instruction,
            builtin_fence = instruction.has_builtin_fence(),
            ?width,
            movnt_threshold = info.movnt_threshold,
            "dispatch record built"
        );

        Ok(info)
    }

    /// Build the record for the given capabilities.
    ///
    /// Only x86-64 has compiled flush variants.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn build(caps: &Capabilities, _tunables: &Tunables) -> Result<Self, HardwareError> {
        let instruction = caps.flush.ok_or(HardwareError::NoFlushInstruction)?;
        Err(HardwareError::DispatchMismatch {
            instruction,
            target: std::env::consts::ARCH,
        })
    }

    /// Flush instruction in effect
    #[must_use]
    pub fn flush_instruction(&self) -> FlushInstruction {
        self.flush_instruction
    }

    /// Whether drain can skip its fence after a flush
    #[must_use]
    pub fn flush_has_builtin_fence(&self) -> bool {
        self.flush_instruction.has_builtin_fence()
    }

    /// Vector width of the non-temporal kernels
    #[must_use]
    pub fn vector_width(&self) -> VectorWidth {
        self.width
    }

    /// Length at or above which unhinted copies stream
    #[must_use]
    pub fn movnt_threshold(&self) -> usize {
        self.movnt_threshold
    }

    /// Granularity forced onto every mapping, if any
    #[must_use]
    pub fn force_granularity(&self) -> Option<Granularity> {
        self.force_granularity
    }

    /// Strategy a flushing copy of `len` bytes would use
    #[must_use]
    pub fn strategy(&self, flags: MemFlags, len: usize) -> StoreStrategy {
        select_store(flags, len, self.movnt_threshold)
    }

    /// Write back every cache line touching `addr..addr + len`.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live mapping.
    #[inline]
    pub unsafe fn flush(&self, addr: *const u8, len: usize) {
        // SAFETY: forwarded from the caller.
        unsafe { (self.flush)(addr, len) }
    }

    /// Store fence: orders prior flushes and streaming stores.
    #[inline]
    pub fn fence(&self) {
        (self.fence)();
    }

    /// Wait for prior flushes; skips the fence when the flush is serialized.
    ///
    /// Kernels selected with a serialized flush fence their own streaming
    /// stores, so this is enough to end a [`ArchInfo::memmove_nodrain`].
    #[inline]
    pub fn drain(&self) {
        if !self.flush_has_builtin_fence() {
            (self.fence)();
        }
    }

    /// Move with flush, without the final drain.
    ///
    /// # Safety
    ///
    /// `src` valid for reads and `dst` valid for writes of `len` bytes.
    #[inline]
    pub unsafe fn memmove_nodrain(&self, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
        if len == 0 || dst.cast_const() == src {
            return;
        }
        let kernel = self.memmove.pick(self.strategy(flags, len));
        // SAFETY: forwarded from the caller.
        unsafe { kernel(dst, src, len) }
    }

    /// Fill with flush, without the final drain.
    ///
    /// # Safety
    ///
    /// `dst` valid for writes of `len` bytes.
    #[inline]
    pub unsafe fn memset_nodrain(&self, dst: *mut u8, value: u8, len: usize, flags: MemFlags) {
        if len == 0 {
            return;
        }
        let kernel = self.memset.pick(self.strategy(flags, len));
        // SAFETY: forwarded from the caller.
        unsafe { kernel(dst, value, len) }
    }

    /// Move for persistent caches: never flushes.
    ///
    /// # Safety
    ///
    /// Same as [`ArchInfo::memmove_nodrain`].
    #[inline]
    pub unsafe fn memmove_nodrain_eadr(&self, dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) {
        if len == 0 || dst.cast_const() == src {
            return;
        }
        let kernel = self.memmove_eadr.pick(select_store_eadr(flags));
        // SAFETY: forwarded from the caller.
        unsafe { kernel(dst, src, len) }
    }

    /// Fill for persistent caches: never flushes.
    ///
    /// # Safety
    ///
    /// Same as [`ArchInfo::memset_nodrain`].
    #[inline]
    pub unsafe fn memset_nodrain_eadr(&self, dst: *mut u8, value: u8, len: usize, flags: MemFlags) {
        if len == 0 {
            return;
        }
        let kernel = self.memset_eadr.pick(select_store_eadr(flags));
        // SAFETY: forwarded from the caller.
        unsafe { kernel(dst, value, len) }
    }
}

// ============================================================================
// Process singleton
// ============================================================================

static ARCH: OnceLock<Result<ArchInfo, HardwareError>> = OnceLock::new();

/// Initialize the singleton, computing tunables only on the first call.
pub(crate) fn init_with(tunables: impl FnOnce() -> Tunables) -> Result<&'static ArchInfo, HardwareError> {
    ARCH.get_or_init(|| {
        let tunables = tunables();
        let caps = Capabilities::detect(&tunables);
        ArchInfo::build(&caps, &tunables).inspect_err(|err| {
            tracing::error!(code = err.code(), %err, "persistence unavailable on this platform");
        })
    })
    .as_ref()
    .map_err(Clone::clone)
}

/// The singleton, if initialization already succeeded.
pub(crate) fn get() -> Option<&'static ArchInfo> {
    ARCH.get().and_then(|res| res.as_ref().ok())
}
