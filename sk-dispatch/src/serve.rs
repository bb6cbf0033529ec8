//! Control socket server.
//!
//! Listens on a sequenced-packet Unix socket for tiny command requests.
//! Addresses starting with "@" are abstract; everything else is a
//! pathname. Each connection gets its own OS thread with 30 second
//! send/receive deadlines; the only request today is `version`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::thread;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    accept, bind, listen, recv, send, setsockopt, socket, sockopt, AddressFamily, Backlog,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::time::TimeVal;
use tracing::{debug, info, warn};

const MAX_REQUEST: usize = 8;
const IO_TIMEOUT_SECS: i64 = 30;
const BACKLOG: i32 = 16;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convert a listen address from presentation to socket format.
///
/// Rejects empty addresses and a bare "@".
pub fn resolve_listen_addr(address: &str) -> Option<UnixAddr> {
    match address.strip_prefix('@') {
        Some("") => None,
        Some(name) => UnixAddr::new_abstract(name.as_bytes()).ok(),
        None if address.is_empty() => None,
        None => UnixAddr::new(address).ok(),
    }
}

pub fn handle_request(request: &[u8]) -> &'static [u8] {
    if request == b"version" {
        VERSION.as_bytes()
    } else {
        b"error"
    }
}

/// Accept and serve connections until the listener fails.
pub fn serve(address: &str) -> Result<()> {
    let addr = resolve_listen_addr(address).with_context(|| {
        format!("invalid listen address {address:?}: need pathname or abstract address")
    })?;

    let listener = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("creating listener socket")?;
    bind(listener.as_raw_fd(), &addr).with_context(|| format!("binding to {address:?}"))?;
    listen(&listener, Backlog::new(BACKLOG)?).context("listening")?;

    info!(address, "control socket listening");

    loop {
        let conn = match accept(listener.as_raw_fd()) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(Errno::EINTR | Errno::ECONNABORTED) => continue,
            Err(Errno::EMFILE) => bail!("accept: out of file descriptors"),
            Err(e) => {
                warn!(error = %e, "accept error");
                continue;
            }
        };

        thread::spawn(move || {
            if let Err(e) = serve_conn(conn) {
                warn!(error = %e, "connection error");
            }
        });
    }
}

fn serve_conn(conn: OwnedFd) -> Result<()> {
    let deadline = TimeVal::new(IO_TIMEOUT_SECS, 0);
    setsockopt(&conn, sockopt::ReceiveTimeout, &deadline)?;
    setsockopt(&conn, sockopt::SendTimeout, &deadline)?;

    let mut request = [0u8; MAX_REQUEST];
    loop {
        let n = match recv(conn.as_raw_fd(), &mut request, MsgFlags::empty()) {
            Ok(0) => return Ok(()), // peer closed
            Ok(n) => n,
            // A deadline firing just ends the conversation.
            Err(Errno::EAGAIN) => return Ok(()),
            Err(e) => return Err(e).context("recv"),
        };

        let response = handle_request(&request[..n]);
        debug!(request = n, response = response.len(), "handled request");

        // MSG_NOSIGNAL: a vanished peer must error out, not SIGPIPE us.
        match send(conn.as_raw_fd(), response, MsgFlags::MSG_NOSIGNAL) {
            Ok(_) => {}
            Err(Errno::EAGAIN | Errno::EPIPE) => return Ok(()),
            Err(e) => return Err(e).context("send"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::socketpair;

    #[test]
    fn request_handling() {
        assert_eq!(handle_request(b"version"), VERSION.as_bytes());
        assert_eq!(handle_request(b"ver"), b"error");
        assert_eq!(handle_request(b""), b"error");
        assert_eq!(handle_request(b"versionX"), b"error");
    }

    #[test]
    fn listen_address_resolution() {
        assert!(resolve_listen_addr("").is_none());
        assert!(resolve_listen_addr("@").is_none());

        let path = resolve_listen_addr("/tmp/skdispatch.sock").unwrap();
        assert!(path.path().is_some());

        let abstract_addr = resolve_listen_addr("@skdispatch").unwrap();
        assert!(abstract_addr.path().is_none());
    }

    #[test]
    fn version_over_seqpacket_pair() {
        let (server, client) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        let handle = thread::spawn(move || serve_conn(server));

        send(client.as_raw_fd(), b"version", MsgFlags::empty()).unwrap();
        let mut buf = [0u8; 64];
        let n = recv(client.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], VERSION.as_bytes());

        send(client.as_raw_fd(), b"nonsense", MsgFlags::empty()).unwrap();
        let n = recv(client.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"error");

        drop(client);
        handle.join().unwrap().unwrap();
    }
}
