//! Process-wide tunables
//!
//! Read once, when the dispatch record is built. Changing the environment
//! afterwards has no effect.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::granularity::Granularity;

/// Default length at which bulk copies switch to non-temporal stores.
pub const DEFAULT_MOVNT_THRESHOLD: usize = 256;

/// Environment variable names
pub mod env {
    /// Disable non-temporal kernels entirely
    pub const NO_MOVNT: &str = "PMEM_NO_MOVNT";
    /// Do not use CLWB even when available
    pub const NO_CLWB: &str = "PMEM_NO_CLWB";
    /// Do not use CLFLUSHOPT even when available
    pub const NO_CLFLUSHOPT: &str = "PMEM_NO_CLFLUSHOPT";
    /// Opt in to 256-bit kernels
    pub const AVX: &str = "PMEM_AVX";
    /// Opt in to 512-bit kernels
    pub const AVX512F: &str = "PMEM_AVX512F";
    /// Non-temporal length threshold in bytes
    pub const MOVNT_THRESHOLD: &str = "PMEM_MOVNT_THRESHOLD";
    /// Override the resolved granularity of every mapping
    pub const FORCE_GRANULARITY: &str = "PMEM2_FORCE_GRANULARITY";
}

/// Hardware dispatch tunables
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Tunables {
    /// Use temporal-store kernels only
    pub no_movnt: bool,
    /// Skip CLWB
    pub no_clwb: bool,
    /// Skip CLFLUSHOPT
    pub no_clflushopt: bool,
    /// Allow AVX kernels when supported
    pub avx: bool,
    /// Allow AVX-512F kernels when supported
    pub avx512f: bool,
    /// Length at or above which unhinted copies use non-temporal stores
    pub movnt_threshold: usize,
    /// Granularity forced onto every new mapping
    pub force_granularity: Option<Granularity>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            no_movnt: false,
            no_clwb: false,
            no_clflushopt: false,
            avx: false,
            avx512f: false,
            movnt_threshold: DEFAULT_MOVNT_THRESHOLD,
            force_granularity: None,
        }
    }
}

impl Tunables {
    /// Read tunables from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read tunables from an arbitrary variable lookup
    ///
    /// Switches are on only when set to exactly `1`. A negative or unparsable
    /// threshold and an unknown granularity name are logged and ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let switch = |key: &str| lookup(key).is_some_and(|v| v == "1");

        let mut tunables = Self {
            no_movnt: switch(env::NO_MOVNT),
            no_clwb: switch(env::NO_CLWB),
            no_clflushopt: switch(env::NO_CLFLUSHOPT),
            avx: switch(env::AVX),
            avx512f: switch(env::AVX512F),
            ..Self::default()
        };

        if let Some(raw) = lookup(env::MOVNT_THRESHOLD) {
            match raw.trim().parse::<i64>() {
                Ok(value) if value >= 0 => {
                    tunables.movnt_threshold = usize::try_from(value).unwrap_or(usize::MAX);
                }
                _ => tracing::warn!(
                    value = %raw,
                    default = DEFAULT_MOVNT_THRESHOLD,
                    "invalid {}, keeping default",
                    env::MOVNT_THRESHOLD
                ),
            }
        }

        if let Some(raw) = lookup(env::FORCE_GRANULARITY) {
            match raw.parse::<Granularity>() {
                Ok(granularity) => tunables.force_granularity = Some(granularity),
                Err(err) => tracing::warn!(%err, "ignoring {}", env::FORCE_GRANULARITY),
            }
        }

        tunables
    }
}
