#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
//! # Durable System
//!
//! Hardware and platform facts for the durable persistence layer.
//!
//! This crate answers the questions the dispatch engine asks before any
//! mapping exists:
//! - Which cache-flush instructions does the CPU implement?
//! - Which vector widths can issue non-temporal stores?
//! - What is the cache line and page size?
//! - Does the platform flush CPU caches on power loss (eADR)?
//!
//! ## Example
//!
//! ```no_run
//! let cpu = durable_system::cpu::features();
//! println!("clwb: {}, clflushopt: {}", cpu.clwb, cpu.clflushopt);
//! println!("page size: {}", durable_system::platform::page_size());
//! println!("eADR: {}", durable_system::platform::eadr_available());
//! ```

pub mod cpu;
pub mod error;
pub mod platform;
pub mod utils;

// Re-exports
pub use cpu::CpuFeatures;
pub use error::{Result, SystemError};
pub use platform::PersistenceDomain;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get a one-line summary of the persistence-relevant platform facts
#[must_use]
pub fn summary() -> String {
    let cpu = cpu::features();
    format!(
        "clflush={} clflushopt={} clwb={} avx={} avx512f={} cache_line={} page={} eadr={}",
        cpu.clflush,
        cpu.clflushopt,
        cpu.clwb,
        cpu.avx,
        cpu.avx512f,
        cpu.cache_line_size,
        utils::format_bytes_usize(platform::page_size()),
        platform::eadr_available(),
    )
}
