//! Mapping assembly against regular files (page granularity)

#![cfg(all(unix, target_arch = "x86_64"))]

mod common;

use common::{backing_file, open_rw};
use durable_pmem::{ErrorKind, FlushKind, Granularity, MapConfig, MemFlags, PmemError, map};
use durable_system::platform::page_size;
use pretty_assertions::assert_eq;

#[test]
fn regular_file_maps_at_page_granularity() {
    let tmp = backing_file(3 * page_size() + 100);
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();

    assert_eq!(mapping.granularity(), Granularity::Page);
    assert_eq!(mapping.ops().describe().flush, FlushKind::Msync);
    assert_eq!(mapping.content_length(), 3 * page_size() + 100);
    assert_eq!(mapping.reserved_length(), 4 * page_size());
    assert_eq!(mapping.address() as usize % page_size(), 0);
    assert!(durable_pmem::arch().is_some());
}

#[test]
fn finer_request_than_effective_fails() {
    let tmp = backing_file(page_size());
    let source = open_rw(&tmp);

    let err = map(&MapConfig::new(Granularity::CacheLine), &source).unwrap_err();
    assert!(matches!(
        err,
        PmemError::GranularityNotSupported {
            effective: Granularity::Page,
            requested: Granularity::CacheLine,
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn offset_and_length_validation() {
    let page = page_size();
    let tmp = backing_file(2 * page);
    let source = open_rw(&tmp);
    let base = MapConfig::new(Granularity::Page);

    let err = map(&base.clone().with_offset(100), &source).unwrap_err();
    assert!(matches!(err, PmemError::OffsetUnaligned { offset: 100, .. }));

    let err = map(&base.clone().with_offset(page as u64).with_length(page + 1), &source).unwrap_err();
    assert!(matches!(err, PmemError::MapRangeExceedsSource { .. }));

    let err = map(&base.clone().with_offset(4 * page as u64), &source).unwrap_err();
    assert!(matches!(err, PmemError::MapRangeExceedsSource { .. }));

    let err = map(&base.clone().with_offset(2 * page as u64), &source).unwrap_err();
    assert!(matches!(err, PmemError::LengthZero));

    let tail = map(&base.with_offset(page as u64), &source).unwrap();
    assert_eq!(tail.content_length(), page);
    let mut first = [0u8; 1];
    tail.read(0, &mut first).unwrap();
    assert_eq!(first[0], (page % 251) as u8);
}

#[test]
fn empty_file_is_length_zero() {
    let tmp = backing_file(0);
    let source = open_rw(&tmp);
    let err = map(&MapConfig::new(Granularity::Page), &source).unwrap_err();
    assert!(matches!(err, PmemError::LengthZero));
}

#[test]
fn round_trip_through_bound_memcpy() {
    let len = 256 * 1024;
    let tmp = backing_file(len);
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();

    for n in [0usize, 1, 255, 256, 200_000] {
        let data: Vec<u8> = (0..n).map(|i| (i * 7 + n) as u8).collect();
        // SAFETY: n bytes at the start of a writable mapping of `len` bytes.
        unsafe { mapping.ops().memcpy(mapping.address(), data.as_ptr(), n, MemFlags::empty()) };
        // SAFETY: reading back the bytes just written.
        let back = unsafe { std::slice::from_raw_parts(mapping.address(), n) };
        assert_eq!(back, &data[..], "n = {n}");
    }

    // durable on disk, not just in the mapping
    let on_disk = std::fs::read(tmp.path()).unwrap();
    let expected: Vec<u8> = (0..200_000usize).map(|i| (i * 7 + 200_000) as u8).collect();
    assert_eq!(&on_disk[..200_000], &expected[..]);
}

#[test]
fn checked_helpers() {
    let tmp = backing_file(8192);
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();

    mapping.write(10, b"durable", MemFlags::empty()).unwrap();
    mapping.fill(100, 0xAA, 50, MemFlags::NOFLUSH).unwrap();
    mapping.persist(100, 50).unwrap();
    mapping.copy_within(10, 12, 7, MemFlags::empty()).unwrap();
    mapping.flush(0, 8192).unwrap();
    mapping.drain();

    let mut back = [0u8; 9];
    mapping.read(10, &mut back).unwrap();
    assert_eq!(&back, b"dudurable");

    let err = mapping.write(8190, b"abc", MemFlags::empty()).unwrap_err();
    assert!(matches!(err, PmemError::OutOfBounds { offset: 8190, len: 3, length: 8192 }));
    assert!(mapping.read(usize::MAX, &mut back).is_err());

    // zero-length requests are no-ops, even at the end of the mapping
    mapping.write(8192, &[], MemFlags::empty()).unwrap();
    mapping.persist(8192, 0).unwrap();
}

#[test]
fn find_resolves_interior_addresses() {
    let tmp = backing_file(3 * page_size());
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();
    let base = mapping.address();

    for offset in [0, 1, page_size(), mapping.content_length() - 1] {
        let found = durable_pmem::find(base.wrapping_add(offset)).unwrap();
        assert_eq!(found.address(), base);
    }
    assert!(durable_pmem::find(base.wrapping_add(mapping.content_length())).is_none_or(|m| m.address() != base));
}

#[test]
fn drop_unregisters_before_unmap() {
    let tmp = backing_file(page_size());
    let source = open_rw(&tmp);
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();
    let base = mapping.address();

    let held = durable_pmem::find(base).unwrap();
    mapping.write(0, b"still here", MemFlags::empty()).unwrap();
    mapping.unmap().unwrap();

    // the held reference keeps the pages mapped, so nobody else can reuse
    // the address; the registry no longer resolves it
    assert!(durable_pmem::find(base).is_none());
    let mut back = [0u8; 10];
    held.read(0, &mut back).unwrap();
    assert_eq!(&back, b"still here");
}
