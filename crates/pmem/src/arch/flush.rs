//! x86-64 cache flush and fence primitives
//!
//! Every flush loop walks the range in [`FLUSH_ALIGN`] steps starting at the
//! line that contains `addr`, so partially covered lines are flushed too.

use core::arch::asm;
use core::arch::x86_64::_mm_clflush;

use super::FlushInstruction;
use super::memops::Flusher;

/// Stride of the flush loops.
pub const FLUSH_ALIGN: usize = 64;

#[inline(always)]
fn lines(addr: *const u8, len: usize) -> impl Iterator<Item = *const u8> {
    let start = durable_system::utils::align_down(addr as usize, FLUSH_ALIGN);
    let end = if len == 0 { start } else { addr as usize + len };
    (start..end).step_by(FLUSH_ALIGN).map(|line| line as *const u8)
}

/// Store fence: orders prior weakly ordered flushes and non-temporal stores.
#[inline]
pub fn sfence() {
    // SAFETY: sfence touches no memory and has no preconditions.
    unsafe { asm!("sfence", options(nostack, preserves_flags)) };
}


/// CLFLUSH: flushes and invalidates, ordered against other stores.
pub struct Clflush;

/// CLFLUSHOPT: flushes and invalidates, weakly ordered.
pub struct Clflushopt;

/// CLWB: writes back, the line may stay cached.
pub struct Clwb;

impl Flusher for Clflush {
    const INSTRUCTION: Option<FlushInstruction> = Some(FlushInstruction::Clflush);

    #[inline(always)]
    unsafe fn flush_range(addr: *const u8, len: usize) {
        for line in lines(addr, len) {
            // SAFETY: caller guarantees the range is mapped.
            unsafe { _mm_clflush(line) };
        }
    }
}

impl Flusher for Clflushopt {
    const INSTRUCTION: Option<FlushInstruction> = Some(FlushInstruction::Clflushopt);

    #[inline(always)]
    unsafe fn flush_range(addr: *const u8, len: usize) {
        for line in lines(addr, len) {
            // SAFETY: caller guarantees the range is mapped and that the
            // CPU implements CLFLUSHOPT (selected from CPUID only).
            unsafe { asm!("clflushopt [{0}]", in(reg) line, options(nostack, preserves_flags)) };
        }
    }
}

impl Flusher for Clwb {
    const INSTRUCTION: Option<FlushInstruction> = Some(FlushInstruction::Clwb);

    #[inline(always)]
    unsafe fn flush_range(addr: *const u8, len: usize) {
        for line in lines(addr, len) {
            // SAFETY: caller guarantees the range is mapped and that the
            // CPU implements CLWB (selected from CPUID only).
            unsafe { asm!("clwb [{0}]", in(reg) line, options(nostack, preserves_flags)) };
        }
    }
}
