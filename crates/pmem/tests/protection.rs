//! Protection versus source access mode
//!
//! Writes through the raw bound operations on a read-only mapping must fault;
//! the checked helpers must refuse them instead.

#![cfg(all(unix, target_arch = "x86_64"))]

mod common;

use common::{backing_file, dies_with_sigsegv, open_ro, open_rw};
use durable_pmem::{Granularity, MapConfig, MemFlags, Protection, map};
use pretty_assertions::assert_eq;

const LEN: usize = 16 * 1024;

fn config(protection: Protection) -> MapConfig {
    MapConfig::new(Granularity::Page).with_protection(protection)
}

#[test]
fn rw_source_rw_mapping() {
    let tmp = backing_file(LEN);
    let source = open_rw(&tmp);
    let mapping = map(&config(Protection::READ | Protection::WRITE), &source).unwrap();

    let data = [0xEEu8; 100];
    // SAFETY: 100 bytes inside a writable mapping.
    unsafe { mapping.ops().memcpy(mapping.address(), data.as_ptr(), data.len(), MemFlags::empty()) };

    let mut back = [0u8; 100];
    mapping.read(0, &mut back).unwrap();
    assert_eq!(back, data);

    assert!(!dies_with_sigsegv(|| {
        // SAFETY: same as above, in the child.
        unsafe { mapping.ops().memset(mapping.address(), 1, 10, MemFlags::empty()) };
    }));
}

#[test]
fn ro_source_rw_mapping_is_denied() {
    let tmp = backing_file(LEN);
    let source = open_ro(&tmp);

    let err = map(&config(Protection::READ | Protection::WRITE), &source).unwrap_err();
    assert!(err.is_permission_denied(), "{err}");
}

#[test]
fn ro_source_ro_mapping_reads_but_faults_on_write() {
    let tmp = backing_file(LEN);
    let source = open_ro(&tmp);
    let mapping = map(&config(Protection::READ), &source).unwrap();

    let mut back = [0u8; 4];
    mapping.read(251, &mut back).unwrap();
    assert_eq!(back, [0, 1, 2, 3]);

    let installed = durable_system::platform::query_protection(mapping.address()).unwrap();
    assert!(installed.contains(region::Protection::READ));
    assert!(!installed.contains(region::Protection::WRITE));

    let err = mapping.write(0, b"nope", MemFlags::empty()).unwrap_err();
    assert!(err.is_permission_denied());

    assert!(dies_with_sigsegv(|| {
        let data = [1u8; 8];
        // SAFETY: deliberately violates the write protection in the child.
        unsafe { mapping.ops().memcpy(mapping.address(), data.as_ptr(), 8, MemFlags::empty()) };
    }));
}

#[test]
fn rw_source_ro_mapping_faults_on_write() {
    let tmp = backing_file(LEN);
    let source = open_rw(&tmp);
    let mapping = map(&config(Protection::READ), &source).unwrap();

    assert!(dies_with_sigsegv(|| {
        // SAFETY: deliberately violates the write protection in the child.
        unsafe { mapping.ops().memset(mapping.address(), 0, 64, MemFlags::empty()) };
    }));

    let mut back = [0u8; 1];
    mapping.read(7, &mut back).unwrap();
    assert_eq!(back, [7]);
}

#[test]
fn none_protection_faults_on_read() {
    let tmp = backing_file(LEN);
    let source = open_rw(&tmp);
    let mapping = map(&config(Protection::empty()), &source).unwrap();

    let mut back = [0u8; 1];
    assert!(mapping.read(0, &mut back).unwrap_err().is_permission_denied());
    assert!(mapping.persist(0, 1).unwrap_err().is_permission_denied());

    let addr = mapping.address() as usize;
    assert!(dies_with_sigsegv(move || {
        // SAFETY: deliberately reads an inaccessible page in the child.
        let byte = unsafe { std::ptr::read_volatile(addr as *const u8) };
        std::hint::black_box(byte);
    }));
}

#[test]
fn write_only_source_cannot_be_read_mapped() {
    let tmp = backing_file(LEN);
    let file = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
    let source = durable_pmem::Source::from_file(file).unwrap();

    let err = map(&config(Protection::READ), &source).unwrap_err();
    assert!(err.is_permission_denied());
}
