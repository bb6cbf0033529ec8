//! Destination table: registered server sockets, keyed by
//! (address family, L4 protocol, label id).
//!
//! Sockets are inspected through getsockopt before registration; the
//! kernel holds its own reference once the fd is inserted, so the control
//! plane never retains the descriptor.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use aya::maps::MapData;

use sk_dispatch_common::{DestinationKey, AF_INET, AF_INET6};

use crate::binding::Protocol;
use crate::errors::{DispatchError, Result};
use crate::labels::LabelId;
use crate::sys;

// ---------------------------------------------------------------------------
// Socket identity
// ---------------------------------------------------------------------------

/// L3 family of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const fn number(self) -> u8 {
        match self {
            Family::V4 => AF_INET,
            Family::V6 => AF_INET6,
        }
    }

    pub fn from_number(n: u8) -> Option<Family> {
        match n {
            AF_INET => Some(Family::V4),
            AF_INET6 => Some(Family::V6),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("ipv4"),
            Family::V6 => f.write_str("ipv6"),
        }
    }
}

/// Opaque kernel identifier of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketCookie(pub u64);

impl fmt::Display for SocketCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sk:{:x}", self.0)
    }
}

/// What getsockopt and getpeername say about a socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketInfo {
    pub domain: i32,
    pub sotype: i32,
    pub protocol: i32,
    pub listening: bool,
    pub unconnected: bool,
    pub cookie: SocketCookie,
}

fn getsockopt_int(fd: BorrowedFd<'_>, opt: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = mem::size_of::<i32>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn getsockopt_u64(fd: BorrowedFd<'_>, opt: i32) -> io::Result<u64> {
    let mut value: u64 = 0;
    let mut len = mem::size_of::<u64>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

/// Query the socket's family, type, protocol, listening and connection
/// state, and cookie.
pub fn inspect_socket(fd: BorrowedFd<'_>) -> Result<SocketInfo> {
    let domain = getsockopt_int(fd, libc::SO_DOMAIN)?;
    let sotype = getsockopt_int(fd, libc::SO_TYPE)?;
    let protocol = getsockopt_int(fd, libc::SO_PROTOCOL)?;
    let listening = getsockopt_int(fd, libc::SO_ACCEPTCONN)? == 1;

    // A peer query answering ENOTCONN is the definition of "unconnected".
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    let unconnected = if ret == 0 {
        false
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOTCONN) {
            return Err(err.into());
        }
        true
    };

    let cookie = SocketCookie(getsockopt_u64(fd, libc::SO_COOKIE)?);

    Ok(SocketInfo {
        domain,
        sotype,
        protocol,
        listening,
        unconnected,
        cookie,
    })
}

/// Check that a socket is something the data plane can steer traffic to:
/// an inet listening stream socket or an inet unconnected datagram socket.
pub fn validate_socket(info: &SocketInfo) -> Result<(Family, Protocol)> {
    let family = match info.domain {
        libc::AF_INET => Family::V4,
        libc::AF_INET6 => Family::V6,
        other => {
            return Err(DispatchError::Unsupported(format!("socket domain {other}")));
        }
    };

    match info.sotype {
        libc::SOCK_STREAM => {
            if info.protocol != libc::IPPROTO_TCP {
                return Err(DispatchError::Unsupported(format!(
                    "stream socket protocol {}",
                    info.protocol
                )));
            }
            if !info.listening {
                return Err(DispatchError::Unsupported(
                    "stream socket is not listening".into(),
                ));
            }
            Ok((family, Protocol::Tcp))
        }
        libc::SOCK_DGRAM => {
            if info.protocol != libc::IPPROTO_UDP {
                return Err(DispatchError::Unsupported(format!(
                    "datagram socket protocol {}",
                    info.protocol
                )));
            }
            if !info.unconnected {
                return Err(DispatchError::Unsupported(
                    "datagram socket is connected".into(),
                ));
            }
            Ok((family, Protocol::Udp))
        }
        other => Err(DispatchError::Unsupported(format!("socket type {other}"))),
    }
}

pub(crate) fn destination_key(
    family: Family,
    protocol: Protocol,
    id: LabelId,
) -> DestinationKey {
    DestinationKey {
        family: family.number(),
        protocol: protocol.number(),
        _pad: [0; 2],
        label_id: id.get(),
    }
}

// ---------------------------------------------------------------------------
// Destinations map
// ---------------------------------------------------------------------------

/// The pinned destinations sockhash. Element access goes through the raw
/// syscall wrappers; see `sys` for why.
pub struct Destinations {
    map: MapData,
}

impl Destinations {
    pub fn new(map: MapData) -> Destinations {
        Destinations { map }
    }

    fn raw_fd(&self) -> RawFd {
        self.map.fd().as_fd().as_raw_fd()
    }

    /// Cookie currently registered under `key`, if any.
    pub fn cookie(&self, key: &DestinationKey) -> Result<Option<SocketCookie>> {
        Ok(sys::map_lookup_cookie(self.raw_fd(), key)?.map(SocketCookie))
    }

    /// Point `key` at the socket behind `sock`. Replaces any previous
    /// registration.
    pub fn assign(&mut self, key: &DestinationKey, sock: BorrowedFd<'_>) -> Result<()> {
        sys::map_update_sock(self.raw_fd(), key, sock.as_raw_fd())
    }

    /// Snapshot of all registered keys and their cookies.
    pub fn entries(&self) -> Result<Vec<(DestinationKey, SocketCookie)>> {
        let mut entries = Vec::new();
        let mut prev: Option<DestinationKey> = None;
        while let Some(key) = sys::map_next_key(self.raw_fd(), prev.as_ref())? {
            // A slot can vanish between next_key and lookup; skip it.
            if let Some(cookie) = self.cookie(&key)? {
                entries.push((key, cookie));
            }
            prev = Some(key);
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Registration outcome
// ---------------------------------------------------------------------------

/// Result of a successful socket registration, returned to the caller so
/// the informational event can be logged (or tested) outside the core.
#[derive(Debug, Clone)]
pub struct Registration {
    pub label: String,
    pub family: Family,
    pub protocol: Protocol,
    pub cookie: SocketCookie,
    pub previous: Option<SocketCookie>,
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.previous {
            Some(previous) if previous != self.cookie => write!(
                f,
                "updated destination ({}, {}, {}) from {} to {}",
                self.family, self.protocol, self.label, previous, self.cookie
            ),
            _ => write!(
                f,
                "created destination ({}, {}, {}) -> {}",
                self.family, self.protocol, self.label, self.cookie
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_info() -> SocketInfo {
        SocketInfo {
            domain: libc::AF_INET,
            sotype: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
            listening: true,
            unconnected: false,
            cookie: SocketCookie(1),
        }
    }

    fn dgram_info() -> SocketInfo {
        SocketInfo {
            domain: libc::AF_INET6,
            sotype: libc::SOCK_DGRAM,
            protocol: libc::IPPROTO_UDP,
            listening: false,
            unconnected: true,
            cookie: SocketCookie(2),
        }
    }

    #[test]
    fn accepts_listening_stream_and_unconnected_dgram() {
        assert_eq!(
            validate_socket(&stream_info()).unwrap(),
            (Family::V4, Protocol::Tcp)
        );
        assert_eq!(
            validate_socket(&dgram_info()).unwrap(),
            (Family::V6, Protocol::Udp)
        );
    }

    #[test]
    fn rejects_unsupported_sockets() {
        let mut info = stream_info();
        info.domain = libc::AF_UNIX;
        assert!(matches!(
            validate_socket(&info),
            Err(DispatchError::Unsupported(_))
        ));

        let mut info = stream_info();
        info.sotype = libc::SOCK_RAW;
        assert!(validate_socket(&info).is_err());

        let mut info = stream_info();
        info.listening = false;
        let err = validate_socket(&info).unwrap_err();
        assert!(err.to_string().contains("not listening"));

        let mut info = dgram_info();
        info.unconnected = false;
        let err = validate_socket(&info).unwrap_err();
        assert!(err.to_string().contains("connected"));

        let mut info = dgram_info();
        info.protocol = libc::IPPROTO_UDPLITE;
        assert!(validate_socket(&info).is_err());
    }

    #[test]
    fn destination_key_layout() {
        let key = destination_key(Family::V6, Protocol::Udp, LabelId(7));
        assert_eq!(key.family, 10);
        assert_eq!(key.protocol, 17);
        assert_eq!(key._pad, [0, 0]);
        assert_eq!(key.label_id, 7);
    }

    #[test]
    fn cookie_display() {
        assert_eq!(SocketCookie(0xdead_beef).to_string(), "sk:deadbeef");
    }

    #[test]
    fn registration_event_wording() {
        let mut reg = Registration {
            label: "web".into(),
            family: Family::V4,
            protocol: Protocol::Tcp,
            cookie: SocketCookie(0x2),
            previous: None,
        };
        assert_eq!(
            reg.to_string(),
            "created destination (ipv4, tcp, web) -> sk:2"
        );

        reg.previous = Some(SocketCookie(0x1));
        assert_eq!(
            reg.to_string(),
            "updated destination (ipv4, tcp, web) from sk:1 to sk:2"
        );
    }
}
