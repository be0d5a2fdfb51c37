//! Process-wide index of live mappings
//!
//! Keyed by range start in an ordered map; lookups take the greatest start
//! not above the address and check containment. The registry holds weak
//! references only, so it never keeps a mapping alive.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{PmemError, Result};

/// Something occupying a half-open address range
pub trait AddressRange {
    /// First address
    fn start(&self) -> usize;
    /// Number of bytes, never zero for registered values
    fn length(&self) -> usize;
}

#[derive(Debug)]
struct Entry<T> {
    end: usize,
    value: Weak<T>,
}

/// Interval index of address ranges
#[derive(Debug)]
pub struct Registry<T> {
    entries: RwLock<BTreeMap<usize, Entry<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: AddressRange> Registry<T> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `value` under its range.
    ///
    /// Fails with [`PmemError::MappingExists`] if the range overlaps an
    /// entry already present.
    pub fn register(&self, value: &Arc<T>) -> Result<()> {
        let start = value.start();
        let end = start + value.length();

        let mut entries = self.entries.write();

        loop {
            let overlapping = entries
                .range(..end)
                .next_back()
                .filter(|(_, other)| other.end > start)
                .map(|(&other_start, other)| (other_start, other.end, other.value.strong_count() > 0));

            let Some((other_start, other_end, alive)) = overlapping else {
                break;
            };
            if alive {
                return Err(PmemError::MappingExists {
                    start: other_start,
                    end: other_end,
                });
            }
            // Owner dropped without unregistering; the range is free again.
            entries.remove(&other_start);
        }

        entries.insert(
            start,
            Entry {
                end,
                value: Arc::downgrade(value),
            },
        );
        tracing::trace!(start = format_args!("{start:#x}"), end = format_args!("{end:#x}"), "registered");
        Ok(())
    }

    /// Remove the entry for `value`.
    ///
    /// Returns `false`, changing nothing, if `value` is not registered.
    pub fn unregister(&self, value: &T) -> bool {
        let start = value.start();
        let mut entries = self.entries.write();

        let ours = entries
            .get(&start)
            .is_some_and(|entry| std::ptr::eq(entry.value.as_ptr(), value));
        if !ours {
            tracing::trace!(start = format_args!("{start:#x}"), "unregister of unknown range");
            return false;
        }

        entries.remove(&start);
        tracing::trace!(start = format_args!("{start:#x}"), "unregistered");
        true
    }

    /// Value whose range contains `addr`.
    ///
    /// Entries whose value is already being dropped read as absent.
    pub fn find(&self, addr: usize) -> Option<Arc<T>> {
        let entries = self.entries.read();
        let (_, entry) = entries.range(..=addr).next_back()?;
        if addr < entry.end {
            entry.value.upgrade()
        } else {
            None
        }
    }

    /// Number of registered ranges
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
