//! Platform facts: page size and the persistence domain
//!
//! The persistence domain tells whether CPU caches are part of it (eADR).
//! On Linux it is published per NVDIMM region under
//! `/sys/bus/nd/devices/region*/persistence_domain`.

use std::path::Path;
use std::sync::OnceLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root of the NVDIMM bus in sysfs.
pub const ND_BUS_DEVICES: &str = "/sys/bus/nd/devices";

/// Persistence domain reported by a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PersistenceDomain {
    /// CPU caches are flushed on power loss (eADR)
    CpuCache,
    /// Memory controller write queues are flushed (ADR)
    MemoryController,
    /// Region reports no domain or something unrecognised
    Unknown,
}

impl PersistenceDomain {
    /// Parse the content of a `persistence_domain` attribute.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "cpu_cache" => Self::CpuCache,
            "memory_controller" => Self::MemoryController,
            _ => Self::Unknown,
        }
    }
}

/// Get the system page size in bytes
#[inline]
#[must_use]
pub fn page_size() -> usize {
    region::page::size()
}

/// Whether the platform guarantees eADR for every persistent memory region.
///
/// Detected once per process. Any region outside the CPU-cache domain, or no
/// region at all, means explicit flushes are required.
#[must_use]
pub fn eadr_available() -> bool {
    static EADR: OnceLock<bool> = OnceLock::new();
    *EADR.get_or_init(|| {
        let eadr = detect_eadr_in(Path::new(ND_BUS_DEVICES));
        tracing::debug!(eadr, "persistence domain probed");
        eadr
    })
}

/// Scan an `nd` bus directory for region persistence domains.
///
/// Missing directories and unreadable attributes count as "not eADR".
#[must_use]
pub fn detect_eadr_in(bus: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(bus) else {
        return false;
    };

    let mut regions = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("region") {
            continue;
        }
        regions += 1;

        let domain = std::fs::read_to_string(entry.path().join("persistence_domain"))
            .map(|raw| PersistenceDomain::parse(&raw))
            .unwrap_or(PersistenceDomain::Unknown);

        if domain != PersistenceDomain::CpuCache {
            tracing::debug!(region = %name.to_string_lossy(), ?domain, "region is not eADR");
            return false;
        }
    }

    regions > 0
}

/// Access rights currently applied to the page containing `ptr`.
///
/// Thin wrapper over `region::query`, used to verify what the OS actually
/// installed for a mapping.
pub fn query_protection(ptr: *const u8) -> Result<region::Protection> {
    Ok(region::query(ptr)?.protection())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn region_dir(root: &Path, name: &str, domain: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(domain) = domain {
            fs::write(dir.join("persistence_domain"), format!("{domain}\n")).unwrap();
        }
    }

    #[test]
    fn test_parse_domain() {
        assert_eq!(PersistenceDomain::parse("cpu_cache\n"), PersistenceDomain::CpuCache);
        assert_eq!(
            PersistenceDomain::parse("memory_controller"),
            PersistenceDomain::MemoryController
        );
        assert_eq!(PersistenceDomain::parse(""), PersistenceDomain::Unknown);
    }

    #[test]
    fn test_all_regions_cpu_cache() {
        let tmp = tempfile::tempdir().unwrap();
        region_dir(tmp.path(), "region0", Some("cpu_cache"));
        region_dir(tmp.path(), "region1", Some("cpu_cache"));
        region_dir(tmp.path(), "namespace0.0", None);
        assert!(detect_eadr_in(tmp.path()));
    }

    #[test]
    fn test_one_region_adr_only() {
        let tmp = tempfile::tempdir().unwrap();
        region_dir(tmp.path(), "region0", Some("cpu_cache"));
        region_dir(tmp.path(), "region1", Some("memory_controller"));
        assert!(!detect_eadr_in(tmp.path()));
    }

    #[test]
    fn test_missing_attribute_is_not_eadr() {
        let tmp = tempfile::tempdir().unwrap();
        region_dir(tmp.path(), "region0", None);
        assert!(!detect_eadr_in(tmp.path()));
    }

    #[test]
    fn test_no_regions() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!detect_eadr_in(tmp.path()));
        assert!(!detect_eadr_in(&tmp.path().join("does-not-exist")));
    }

    #[test]
    fn test_page_size() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }
}
