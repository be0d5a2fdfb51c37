//! Cache-line granularity forced onto regular files
//!
//! Every test initializes with the same tunables; the first call wins and
//! the rest get the same record.

#![cfg(all(unix, target_arch = "x86_64"))]

mod common;

use common::{backing_file, open_rw};
use durable_pmem::config::{DEFAULT_MOVNT_THRESHOLD, env};
use durable_pmem::{
    ArchInfo, DrainKind, FlushKind, Granularity, MapConfig, MemFlags, MemKind, StoreStrategy, Tunables, map,
};
use pretty_assertions::assert_eq;

fn setup() -> &'static ArchInfo {
    durable_log::init_test();
    let tunables = Tunables::from_lookup(|key| match key {
        env::FORCE_GRANULARITY => Some("CACHE_LINE".to_string()),
        env::MOVNT_THRESHOLD => Some("-5".to_string()),
        _ => None,
    });
    durable_pmem::init_with(tunables).unwrap()
}

#[test]
fn negative_threshold_keeps_default_and_initializes() {
    let arch = setup();
    assert_eq!(arch.movnt_threshold(), DEFAULT_MOVNT_THRESHOLD);
    assert_eq!(arch.force_granularity(), Some(Granularity::CacheLine));
}

#[test]
fn most_precise_flush_is_in_effect() {
    let arch = setup();
    let cpu = durable_system::cpu::features();
    let expected = if cpu.clwb {
        durable_pmem::FlushInstruction::Clwb
    } else if cpu.clflushopt {
        durable_pmem::FlushInstruction::Clflushopt
    } else {
        durable_pmem::FlushInstruction::Clflush
    };
    assert_eq!(arch.flush_instruction(), expected);
    assert_eq!(arch.flush_has_builtin_fence(), expected.has_builtin_fence());
}

#[test]
fn bound_ops_use_flush_instruction() {
    let arch = setup();
    let tmp = backing_file(64 * 1024);
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::CacheLine), &source).unwrap();

    let profile = mapping.ops().describe();
    assert_eq!(profile.granularity, Granularity::CacheLine);
    assert_eq!(profile.flush, FlushKind::Instruction(arch.flush_instruction()));
    assert_eq!(profile.mem, MemKind::Flushing(arch.vector_width()));
    let drain = if arch.flush_has_builtin_fence() {
        DrainKind::Empty
    } else {
        DrainKind::Fence
    };
    assert_eq!(profile.drain, drain);
}

#[test]
fn round_trip_at_threshold_boundary() {
    let arch = setup();
    let t = arch.movnt_threshold();
    assert_eq!(arch.strategy(MemFlags::empty(), t - 1), StoreStrategy::Temporal);
    assert_eq!(arch.strategy(MemFlags::empty(), t), StoreStrategy::NonTemporal);

    let tmp = backing_file(1 << 20);
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();

    for n in [0, 1, t - 1, t, (1 << 20) - 13] {
        let data: Vec<u8> = (0..n).map(|i| (i ^ n) as u8).collect();
        // start off a cache line boundary so head and tail paths run
        let dst = mapping.address().wrapping_add(13.min((1 << 20) - n));
        // SAFETY: n bytes inside the writable mapping.
        unsafe { mapping.ops().memcpy(dst, data.as_ptr(), n, MemFlags::empty()) };
        // SAFETY: reading back the bytes just written.
        let back = unsafe { std::slice::from_raw_parts(dst, n) };
        assert_eq!(back, &data[..], "n = {n}");
    }
}

#[test]
fn hinted_fill_and_move() {
    setup();
    let tmp = backing_file(32 * 1024);
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::CacheLine), &source).unwrap();

    mapping.fill(1, 0x3C, 20_000, MemFlags::NONTEMPORAL).unwrap();
    mapping.fill(30_000, 0x7E, 100, MemFlags::TEMPORAL | MemFlags::NODRAIN).unwrap();
    mapping.drain();
    mapping.copy_within(1, 5, 20_000, MemFlags::WC).unwrap();

    let mut back = vec![0u8; 20_004];
    mapping.read(1, &mut back).unwrap();
    assert!(back.iter().all(|b| *b == 0x3C));

    let mut tail = [0u8; 100];
    mapping.read(30_000, &mut tail).unwrap();
    assert!(tail.iter().all(|b| *b == 0x7E));
}
