//! Shared helpers for the mapping integration tests

#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::Write;

use durable_pmem::Source;
use tempfile::NamedTempFile;

/// Temporary file of `len` bytes, each set to its index modulo 251
pub fn backing_file(len: usize) -> NamedTempFile {
    let mut tmp = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    tmp.write_all(&data).unwrap();
    tmp.flush().unwrap();
    tmp
}

pub fn open_ro(tmp: &NamedTempFile) -> Source {
    Source::from_file(File::open(tmp.path()).unwrap()).unwrap()
}

pub fn open_rw(tmp: &NamedTempFile) -> Source {
    let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
    Source::from_file(file).unwrap()
}

/// Run `f` in a forked child and report whether it died from SIGSEGV.
pub fn dies_with_sigsegv(f: impl FnOnce()) -> bool {
    // SAFETY: the child only runs `f`, which touches memory and nothing
    // lock-protected, then exits without unwinding.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: plain syscalls in the child.
        unsafe {
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
        }
        f();
        // SAFETY: see above.
        unsafe { libc::_exit(0) };
    }

    let mut status = 0;
    // SAFETY: waiting on our own child.
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGSEGV
}
