//! Map a file, write through the bound operations, and report the choices
//! the dispatch engine made.
//!
//! ```sh
//! DURABLE_LOG=debug cargo run -p durable-pmem --example basic -- /mnt/pmem/demo
//! ```

use std::fs::OpenOptions;

use durable_pmem::{Granularity, MapConfig, MemFlags, PmemError, Source};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    durable_log::auto_init()?;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| std::env::temp_dir().join("durable-demo").display().to_string());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| PmemError::from_os("open", err))?;
    if file.metadata()?.len() < 64 * 1024 {
        file.set_len(64 * 1024)?;
    }

    let arch = durable_pmem::init()?;
    durable_log::info!(
        flush = %arch.flush_instruction(),
        width = ?arch.vector_width(),
        threshold = arch.movnt_threshold(),
        "dispatch"
    );

    let source = Source::from_file(file)?;
    let mapping = durable_pmem::map(&MapConfig::new(Granularity::Page), &source)?;

    mapping.write(0, b"hello, durable world", MemFlags::empty())?;
    mapping.fill(4096, 0xFF, 8192, MemFlags::NONTEMPORAL)?;

    let profile = mapping.ops().describe();
    println!("{path}: {} bytes at {:p}", mapping.content_length(), mapping.address());
    println!("granularity {}  flush {:?}  drain {:?}  mem {:?}", profile.granularity, profile.flush, profile.drain, profile.mem);
    println!("{}", durable_system::summary());

    mapping.unmap()?;
    Ok(())
}
