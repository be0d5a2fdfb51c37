//! Effective persistence granularity
//!
//! The granularity is the coarsest unit a caller must track to make a store
//! durable. It is resolved once per mapping from two platform facts and never
//! changes afterwards.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Persistence granularity, ordered finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Granularity {
    /// CPU caches are in the persistence domain; stores are durable once
    /// globally visible.
    Byte,
    /// Each touched cache line must be flushed and fenced.
    CacheLine,
    /// Ordinary file-backed mapping; durability comes from page sync.
    Page,
}

/// Resolve the granularity for a mapping.
///
/// | eADR | persistent memory | result |
/// |------|-------------------|--------|
/// | yes  | yes               | `Byte` |
/// | no   | yes               | `CacheLine` |
/// | any  | no                | `Page` |
#[must_use]
pub fn resolve(eadr: bool, is_pmem: bool) -> Granularity {
    match (eadr, is_pmem) {
        (true, true) => Granularity::Byte,
        (false, true) => Granularity::CacheLine,
        (_, false) => Granularity::Page,
    }
}

/// Apply a granularity forced through the environment over the resolved one.
///
/// Forcing a coarser granularity only costs throughput. Forcing a finer one
/// skips flushes the platform needs, so it is reported at error level.
#[must_use]
pub fn apply_forced(resolved: Granularity, forced: Option<Granularity>) -> Granularity {
    match forced {
        None => resolved,
        Some(forced) if forced < resolved => {
            tracing::error!(
                %forced,
                %resolved,
                "forced granularity is finer than the platform provides, stores may not be durable"
            );
            forced
        }
        Some(forced) => {
            tracing::warn!(%forced, %resolved, "granularity forced by environment");
            forced
        }
    }
}

impl Granularity {
    /// Canonical upper-case name, as accepted by `PMEM2_FORCE_GRANULARITY`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Byte => "BYTE",
            Self::CacheLine => "CACHE_LINE",
            Self::Page => "PAGE",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised granularity name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown granularity '{0}'")]
pub struct ParseGranularityError(pub String);

impl FromStr for Granularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BYTE" => Ok(Self::Byte),
            "CACHE_LINE" | "CL" => Ok(Self::CacheLine),
            "PAGE" => Ok(Self::Page),
            _ => Err(ParseGranularityError(s.to_string())),
        }
    }
}
