//! Minimal `bpf(2)` element operations for the destinations sockhash.
//!
//! The destinations map is created with an 8-byte value so the kernel
//! accepts userspace lookups and answers them with the stored socket's
//! cookie. aya's typed `SockHash` models the 4-byte-fd flavour of sock
//! maps and has no element lookup, so the three operations the dispatcher
//! needs go through the syscall directly.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use aya::Pod;

use crate::errors::Result;

const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;

/// `bpf_attr` as used by the map element commands. Pointers travel as
/// u64 regardless of word size; the layout must match the kernel header.
#[repr(C)]
#[derive(Clone, Copy)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

fn sys_bpf(cmd: libc::c_long, attr: &MapElemAttr) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const MapElemAttr,
            mem::size_of::<MapElemAttr>() as libc::c_ulong,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Store `sock_fd` under `key`. The kernel takes its own reference to the
/// socket; the caller's fd is not retained.
pub fn map_update_sock<K: Pod>(map_fd: RawFd, key: &K, sock_fd: RawFd) -> Result<()> {
    // Sock maps with 8-byte values expect the fd widened to u64.
    let value = sock_fd as u64;
    let attr = MapElemAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: key as *const K as u64,
        value_or_next_key: &value as *const u64 as u64,
        flags: 0, // BPF_ANY
    };
    sys_bpf(BPF_MAP_UPDATE_ELEM, &attr)?;
    Ok(())
}

/// Cookie of the socket stored under `key`, or None if the slot is empty.
pub fn map_lookup_cookie<K: Pod>(map_fd: RawFd, key: &K) -> Result<Option<u64>> {
    let mut cookie = 0u64;
    let attr = MapElemAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: key as *const K as u64,
        value_or_next_key: &mut cookie as *mut u64 as u64,
        flags: 0,
    };
    match sys_bpf(BPF_MAP_LOOKUP_ELEM, &attr) {
        Ok(()) => Ok(Some(cookie)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Key following `prev` in iteration order; None past the last key.
/// Iteration starts by passing `prev = None`.
pub fn map_next_key<K: Pod>(map_fd: RawFd, prev: Option<&K>) -> Result<Option<K>> {
    let mut next = mem::MaybeUninit::<K>::uninit();
    let attr = MapElemAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: prev.map_or(0, |k| k as *const K as u64),
        value_or_next_key: next.as_mut_ptr() as u64,
        flags: 0,
    };
    match sys_bpf(BPF_MAP_GET_NEXT_KEY, &attr) {
        Ok(()) => Ok(Some(unsafe { next.assume_init() })),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_layout() {
        // The kernel reads exactly 32 bytes for element commands.
        assert_eq!(mem::size_of::<MapElemAttr>(), 32);
    }

    #[test]
    fn bad_fd_reports_io_error() {
        let key = 0u32;
        let err = map_lookup_cookie(-1, &key).unwrap_err();
        assert!(matches!(err, crate::errors::DispatchError::Io(_)));
    }
}
