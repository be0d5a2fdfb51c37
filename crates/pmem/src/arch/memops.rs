//! Bulk move and set kernels
//!
//! Kernels are generic over a [`Flusher`] (which instruction, if any, writes
//! the touched lines back) and, for the non-temporal family, a [`StreamIsa`]
//! (which vector width issues the streaming stores). The dispatch record
//! stores monomorphized instances as plain function pointers.
//!
//! Non-temporal kernels copy the unaligned head and tail with ordinary
//! stores and flush them; the cache-line aligned body bypasses the cache and
//! needs no flush, only a store fence. That fence normally comes from the
//! drain. When the flusher is serialized the drain is empty, so the kernel
//! fences its own streaming stores.

use core::ptr;

use super::FlushInstruction;

/// Size of one streaming iteration, one cache line.
pub const STREAM_CHUNK: usize = 64;

/// Writes a range of cache lines back toward the persistence domain
pub trait Flusher {
    /// Instruction this flusher issues, `None` for the eADR no-op
    const INSTRUCTION: Option<FlushInstruction>;

    /// # Safety
    ///
    /// `addr..addr + len` must lie inside a live mapping.
    unsafe fn flush_range(addr: *const u8, len: usize);
}

/// Flusher for platforms whose caches are already persistent.
pub struct NoFlush;

impl Flusher for NoFlush {
    const INSTRUCTION: Option<FlushInstruction> = None;

    #[inline(always)]
    unsafe fn flush_range(_addr: *const u8, _len: usize) {}
}

/// Whether non-temporal kernels over `F` fence their streaming stores
/// themselves, because the drain bound next to `F` is empty.
#[inline(always)]
#[must_use]
#[cfg(target_arch = "x86_64")]
pub fn fences_streams<F: Flusher>() -> bool {
    F::INSTRUCTION.is_some_and(FlushInstruction::has_builtin_fence)
}

/// Issues cache-bypassing stores of one vector width
#[cfg(target_arch = "x86_64")]
pub trait StreamIsa {
    /// Stream `chunks` lines from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be [`STREAM_CHUNK`]-aligned, both ranges valid for
    /// `chunks * STREAM_CHUNK` bytes and not overlapping. The CPU must
    /// implement the instruction set.
    unsafe fn stream_copy(dst: *mut u8, src: *const u8, chunks: usize);

    /// Stream `chunks` lines of `value` to `dst`.
    ///
    /// # Safety
    ///
    /// Same as [`StreamIsa::stream_copy`] for `dst`.
    unsafe fn stream_fill(dst: *mut u8, value: u8, chunks: usize);
}

// ============================================================================
// Generic kernels
// ============================================================================

#[inline(always)]
#[cfg(target_arch = "x86_64")]
fn overlaps(dst: *const u8, src: *const u8, len: usize) -> bool {
    let (d, s) = (dst as usize, src as usize);
    d < s.saturating_add(len) && s < d.saturating_add(len)
}

/// Temporal move followed by a flush of the destination.
///
/// # Safety
///
/// `src` valid for reads and `dst` valid for writes of `len` bytes.
pub unsafe fn move_temporal<F: Flusher>(dst: *mut u8, src: *const u8, len: usize) {
    // SAFETY: forwarded from the caller; `ptr::copy` handles overlap.
    unsafe {
        ptr::copy(src, dst, len);
        F::flush_range(dst, len);
    }
}

/// Plain move, durability is left to the caller.
///
/// # Safety
///
/// Same as [`move_temporal`].
pub unsafe fn move_passthrough(dst: *mut u8, src: *const u8, len: usize) {
    // SAFETY: forwarded from the caller.
    unsafe { ptr::copy(src, dst, len) };
}

/// Temporal fill followed by a flush of the destination.
///
/// # Safety
///
/// `dst` valid for writes of `len` bytes.
pub unsafe fn set_temporal<F: Flusher>(dst: *mut u8, value: u8, len: usize) {
    // SAFETY: forwarded from the caller.
    unsafe {
        ptr::write_bytes(dst, value, len);
        F::flush_range(dst, len);
    }
}

/// Plain fill, durability is left to the caller.
///
/// # Safety
///
/// Same as [`set_temporal`].
pub unsafe fn set_passthrough(dst: *mut u8, value: u8, len: usize) {
    // SAFETY: forwarded from the caller.
    unsafe { ptr::write_bytes(dst, value, len) };
}

/// Split `len` bytes at `dst` into (head, streamed chunks, tail).
#[inline(always)]
#[cfg(target_arch = "x86_64")]
fn split(dst: *const u8, len: usize) -> (usize, usize, usize) {
    let head = dst.align_offset(STREAM_CHUNK).min(len);
    let chunks = (len - head) / STREAM_CHUNK;
    let tail = len - head - chunks * STREAM_CHUNK;
    (head, chunks, tail)
}

/// Non-temporal move. Overlapping ranges take the temporal path.
///
/// # Safety
///
/// Same as [`move_temporal`]; the CPU must implement `V`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn move_nontemporal<F: Flusher, V: StreamIsa>(dst: *mut u8, src: *const u8, len: usize) {
    if overlaps(dst, src, len) {
        // SAFETY: forwarded from the caller.
        return unsafe { move_temporal::<F>(dst, src, len) };
    }

    let (head, chunks, tail) = split(dst, len);
    let body = chunks * STREAM_CHUNK;

    // SAFETY: head, body and tail partition the caller's ranges; the body
    // destination is chunk-aligned by construction.
    unsafe {
        ptr::copy_nonoverlapping(src, dst, head);
        F::flush_range(dst, head);

        V::stream_copy(dst.add(head), src.add(head), chunks);
        if fences_streams::<F>() {
            super::flush::sfence();
        }

        let done = head + body;
        ptr::copy_nonoverlapping(src.add(done), dst.add(done), tail);
        F::flush_range(dst.add(done), tail);
    }
}

/// Non-temporal fill.
///
/// # Safety
///
/// Same as [`set_temporal`]; the CPU must implement `V`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn set_nontemporal<F: Flusher, V: StreamIsa>(dst: *mut u8, value: u8, len: usize) {
    let (head, chunks, tail) = split(dst, len);
    let done = head + chunks * STREAM_CHUNK;

    // SAFETY: see move_nontemporal.
    unsafe {
        ptr::write_bytes(dst, value, head);
        F::flush_range(dst, head);

        V::stream_fill(dst.add(head), value, chunks);
        if fences_streams::<F>() {
            super::flush::sfence();
        }

        ptr::write_bytes(dst.add(done), value, tail);
        F::flush_range(dst.add(done), tail);
    }
}

// ============================================================================
// Streaming stores
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod stream {
    use core::arch::x86_64::{
        __m128i, __m256i, _mm_loadu_si128, _mm_set1_epi8, _mm_stream_si128, _mm256_loadu_si256,
        _mm256_set1_epi8, _mm256_stream_si256, _mm512_loadu_si512, _mm512_set1_epi8,
        _mm512_stream_si512,
    };

    use super::{STREAM_CHUNK, StreamIsa};

    /// 128-bit streaming stores, baseline on x86-64.
    pub struct Sse2;
    /// 256-bit streaming stores.
    pub struct Avx;
    /// 512-bit streaming stores.
    pub struct Avx512f;

    #[target_feature(enable = "sse2")]
    unsafe fn sse2_copy(dst: *mut u8, src: *const u8, chunks: usize) {
        for i in 0..chunks {
            let off = i * STREAM_CHUNK;
            for lane in (0..STREAM_CHUNK).step_by(16) {
                // SAFETY: caller contract of StreamIsa::stream_copy.
                unsafe {
                    let v: __m128i = _mm_loadu_si128(src.add(off + lane).cast());
                    _mm_stream_si128(dst.add(off + lane).cast(), v);
                }
            }
        }
    }

    #[target_feature(enable = "sse2")]
    unsafe fn sse2_fill(dst: *mut u8, value: u8, chunks: usize) {
        let v = _mm_set1_epi8(value as i8);
        for i in 0..chunks {
            let off = i * STREAM_CHUNK;
            for lane in (0..STREAM_CHUNK).step_by(16) {
                // SAFETY: caller contract of StreamIsa::stream_fill.
                unsafe { _mm_stream_si128(dst.add(off + lane).cast(), v) };
            }
        }
    }

    #[target_feature(enable = "avx")]
    unsafe fn avx_copy(dst: *mut u8, src: *const u8, chunks: usize) {
        for i in 0..chunks {
            let off = i * STREAM_CHUNK;
            for lane in (0..STREAM_CHUNK).step_by(32) {
                // SAFETY: caller contract of StreamIsa::stream_copy.
                unsafe {
                    let v: __m256i = _mm256_loadu_si256(src.add(off + lane).cast());
                    _mm256_stream_si256(dst.add(off + lane).cast(), v);
                }
            }
        }
    }

    #[target_feature(enable = "avx")]
    unsafe fn avx_fill(dst: *mut u8, value: u8, chunks: usize) {
        let v = _mm256_set1_epi8(value as i8);
        for i in 0..chunks {
            let off = i * STREAM_CHUNK;
            for lane in (0..STREAM_CHUNK).step_by(32) {
                // SAFETY: caller contract of StreamIsa::stream_fill.
                unsafe { _mm256_stream_si256(dst.add(off + lane).cast(), v) };
            }
        }
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn avx512f_copy(dst: *mut u8, src: *const u8, chunks: usize) {
        for i in 0..chunks {
            let off = i * STREAM_CHUNK;
            // SAFETY: caller contract of StreamIsa::stream_copy.
            unsafe {
                let v = _mm512_loadu_si512(src.add(off).cast());
                _mm512_stream_si512(dst.add(off).cast(), v);
            }
        }
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn avx512f_fill(dst: *mut u8, value: u8, chunks: usize) {
        let v = _mm512_set1_epi8(value as i8);
        for i in 0..chunks {
            // SAFETY: caller contract of StreamIsa::stream_fill.
            unsafe { _mm512_stream_si512(dst.add(i * STREAM_CHUNK).cast(), v) };
        }
    }

    impl StreamIsa for Sse2 {
        unsafe fn stream_copy(dst: *mut u8, src: *const u8, chunks: usize) {
            // SAFETY: forwarded from the caller.
            unsafe { sse2_copy(dst, src, chunks) }
        }

        unsafe fn stream_fill(dst: *mut u8, value: u8, chunks: usize) {
            // SAFETY: forwarded from the caller.
            unsafe { sse2_fill(dst, value, chunks) }
        }
    }

    impl StreamIsa for Avx {
        unsafe fn stream_copy(dst: *mut u8, src: *const u8, chunks: usize) {
            // SAFETY: forwarded from the caller, who checked AVX support.
            unsafe { avx_copy(dst, src, chunks) }
        }

        unsafe fn stream_fill(dst: *mut u8, value: u8, chunks: usize) {
            // SAFETY: forwarded from the caller, who checked AVX support.
            unsafe { avx_fill(dst, value, chunks) }
        }
    }

    impl StreamIsa for Avx512f {
        unsafe fn stream_copy(dst: *mut u8, src: *const u8, chunks: usize) {
            // SAFETY: forwarded from the caller, who checked AVX-512F support.
            unsafe { avx512f_copy(dst, src, chunks) }
        }

        unsafe fn stream_fill(dst: *mut u8, value: u8, chunks: usize) {
            // SAFETY: forwarded from the caller, who checked AVX-512F support.
            unsafe { avx512f_fill(dst, value, chunks) }
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub use stream::{Avx, Avx512f, Sse2};

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::arch::flush::{Clflush, Clflushopt, Clwb, sfence};
    use pretty_assertions::assert_eq;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_split_partitions_length() {
        let buf = [0u8; 512];
        for start in 0..64 {
            for len in [0, 1, 63, 64, 65, 200, 400] {
                let (h, c, t) = split(buf.as_ptr().wrapping_add(start), len);
                assert_eq!(h + c * STREAM_CHUNK + t, len);
                assert!(h < STREAM_CHUNK);
                assert!(t < STREAM_CHUNK);
            }
        }
    }

    #[test]
    fn test_nontemporal_copy_unaligned() {
        let src = pattern(1000);
        let mut dst = vec![0u8; 1100];
        for start in [0, 1, 13, 63] {
            dst.fill(0);
            // SAFETY: both buffers are large enough.
            unsafe { move_nontemporal::<Clflush, Sse2>(dst.as_mut_ptr().add(start), src.as_ptr(), src.len()) };
            sfence();
            assert_eq!(&dst[start..start + src.len()], &src[..]);
            assert!(dst[..start].iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_overlapping_move_is_memmove() {
        let mut buf = pattern(600);
        let expected: Vec<u8> = buf[..500].to_vec();
        let base = buf.as_mut_ptr();
        // SAFETY: both ranges lie inside buf.
        unsafe { move_nontemporal::<NoFlush, Sse2>(base.add(100), base, 500) };
        assert_eq!(&buf[100..600], &expected[..]);
    }

    #[test]
    fn test_nontemporal_fill() {
        let mut dst = vec![0u8; 777];
        // SAFETY: dst is 777 bytes long.
        unsafe { set_nontemporal::<NoFlush, Sse2>(dst.as_mut_ptr().add(3), 0xAB, 770) };
        sfence();
        assert_eq!(dst[..3], [0, 0, 0]);
        assert!(dst[3..773].iter().all(|b| *b == 0xAB));
        assert!(dst[773..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_avx_kernels_when_present() {
        if !std::is_x86_feature_detected!("avx") {
            return;
        }
        let src = pattern(4096);
        let mut dst = vec![0u8; 4096];
        // SAFETY: AVX checked above; buffers are the same length.
        unsafe { move_nontemporal::<NoFlush, Avx>(dst.as_mut_ptr(), src.as_ptr(), 4096) };
        sfence();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_only_serialized_flush_fences_streams() {
        assert!(fences_streams::<Clflush>());
        assert!(!fences_streams::<Clflushopt>());
        assert!(!fences_streams::<Clwb>());
        assert!(!fences_streams::<NoFlush>());
    }

    #[test]
    fn test_clflush_streaming_kernels_copy_and_fill() {
        let src = pattern(8192);
        let mut dst = vec![0u8; 8192 + 64];
        // SAFETY: dst has room for 8192 bytes at offset 5.
        unsafe { move_nontemporal::<Clflush, Sse2>(dst.as_mut_ptr().add(5), src.as_ptr(), 8192) };
        assert_eq!(&dst[5..8197], &src[..]);

        // SAFETY: dst holds 8192 + 64 bytes.
        unsafe { set_nontemporal::<Clflush, Sse2>(dst.as_mut_ptr(), 0x3C, 8192) };
        assert!(dst[..8192].iter().all(|b| *b == 0x3C));
    }
}
