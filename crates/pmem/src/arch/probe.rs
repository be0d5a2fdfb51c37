//! Capability probe: raw CPU features filtered through the tunables

use durable_system::CpuFeatures;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{FlushInstruction, VectorWidth};
use crate::config::Tunables;

/// What the dispatch builder may use on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Capabilities {
    /// Flush instruction in effect, `None` when the CPU has none
    pub flush: Option<FlushInstruction>,
    /// Widest vector width enabled for non-temporal kernels
    pub width: VectorWidth,
}

impl Capabilities {
    /// Probe the running CPU
    #[must_use]
    pub fn detect(tunables: &Tunables) -> Self {
        Self::from_features(durable_system::cpu::features(), tunables)
    }

    /// Apply tunables to a feature set
    ///
    /// CLWB is preferred over CLFLUSHOPT, which is preferred over CLFLUSH.
    /// Wider vectors are opt-in: AVX needs `avx`, AVX-512F needs `avx512f`.
    #[must_use]
    pub fn from_features(cpu: CpuFeatures, tunables: &Tunables) -> Self {
        let flush = if cpu.clwb && !tunables.no_clwb {
            Some(FlushInstruction::Clwb)
        } else if cpu.clflushopt && !tunables.no_clflushopt {
            Some(FlushInstruction::Clflushopt)
        } else if cpu.clflush {
            Some(FlushInstruction::Clflush)
        } else {
            None
        };

        let width = if tunables.no_movnt || !cpu.sse2 {
            VectorWidth::Generic
        } else if cpu.avx512f && tunables.avx512f {
            VectorWidth::Avx512f
        } else if cpu.avx && tunables.avx {
            VectorWidth::Avx
        } else {
            VectorWidth::Sse2
        };

        if !cpu.has_any_flush() {
            tracing::debug!("cpu reports no cache flush instruction");
        }
        if cpu.clwb && tunables.no_clwb {
            tracing::debug!("clwb available but disabled");
        }
        if cpu.clflushopt && tunables.no_clflushopt {
            tracing::debug!("clflushopt available but disabled");
        }

        Self { flush, width }
    }
}
