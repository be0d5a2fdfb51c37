//! CPU feature detection relevant to persistence
//!
//! Only the facts the persistence layer dispatches on are probed here: which
//! cache-flush instructions exist, which vector widths can issue
//! non-temporal stores, and the cache line size. Environment policy (opt-ins,
//! opt-outs) is applied by the caller, this module reports raw hardware.

use std::sync::OnceLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Fallback cache line size when CPUID does not report one.
pub const DEFAULT_CACHE_LINE_SIZE: usize = 64;

/// CPU features detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CpuFeatures {
    /// CLFLUSH support (flushes and invalidates, serialized)
    pub clflush: bool,
    /// CLFLUSHOPT support (flushes and invalidates, weakly ordered)
    pub clflushopt: bool,
    /// CLWB support (writes back, line may stay cached)
    pub clwb: bool,
    /// SSE2 support
    pub sse2: bool,
    /// AVX support
    pub avx: bool,
    /// AVX-512 Foundation support
    pub avx512f: bool,
    /// Cache line size (bytes)
    pub cache_line_size: usize,
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self {
            clflush: false,
            clflushopt: false,
            clwb: false,
            sse2: false,
            avx: false,
            avx512f: false,
            cache_line_size: DEFAULT_CACHE_LINE_SIZE,
        }
    }
}

impl CpuFeatures {
    /// Whether any cache-flush instruction is available.
    #[must_use]
    pub fn has_any_flush(&self) -> bool {
        self.clflush || self.clflushopt || self.clwb
    }
}

/// Get CPU features
///
/// The probe runs once per process; later calls return the cached result.
#[must_use]
pub fn features() -> CpuFeatures {
    static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();
    *FEATURES.get_or_init(probe)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn probe() -> CpuFeatures {
    use raw_cpuid::CpuId;

    let cpuid = CpuId::new();
    let mut features = CpuFeatures {
        sse2: is_x86_feature_detected!("sse2"),
        avx: is_x86_feature_detected!("avx"),
        avx512f: is_x86_feature_detected!("avx512f"),
        ..CpuFeatures::default()
    };

    if let Some(info) = cpuid.get_feature_info() {
        features.clflush = info.has_clflush();
        // Reported in 8-byte units.
        let line = usize::from(info.cflush_cache_line_size()) * 8;
        if line != 0 {
            features.cache_line_size = line;
        }
    }

    if let Some(ext) = cpuid.get_extended_feature_info() {
        features.clflushopt = ext.has_clflushopt();
        features.clwb = ext.has_clwb();
    }

    tracing::debug!(
        clflush = features.clflush,
        clflushopt = features.clflushopt,
        clwb = features.clwb,
        avx = features.avx,
        avx512f = features.avx512f,
        cache_line = features.cache_line_size,
        "cpu features probed"
    );

    features
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn probe() -> CpuFeatures {
    tracing::debug!("no cache-flush probing on this architecture");
    CpuFeatures::default()
}

/// Get the cache line size for the current CPU.
#[inline]
#[must_use]
pub fn cache_line_size() -> usize {
    features().cache_line_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_cached() {
        assert_eq!(features(), features());
    }

    #[test]
    fn test_cache_line_is_power_of_two() {
        let line = cache_line_size();
        assert!(line >= 32);
        assert!(line.is_power_of_two());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_baseline() {
        let f = features();
        // SSE2 and CLFLUSH are part of the x86-64 baseline.
        assert!(f.sse2);
        assert!(f.clflush);
        assert!(f.has_any_flush());
    }

    #[test]
    fn test_default_has_no_flush() {
        let f = CpuFeatures::default();
        assert!(!f.has_any_flush());
        assert_eq!(f.cache_line_size, DEFAULT_CACHE_LINE_SIZE);
    }
}
