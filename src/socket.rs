//! Owned TCP socket with the option surface the server needs.
//!
//! Thin wrapper over `socket2`; every socket handled by the library is
//! non-blocking and close-on-exec.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::{debug, error};

use crate::addr::InetAddress;

#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking, close-on-exec IPv4 stream socket.
    ///
    /// # Panics
    /// Socket creation failure is fatal; there is no recovery path for a
    /// process that cannot open a TCP socket.
    pub(crate) fn new_nonblocking() -> Self {
        let inner = match socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(sock) => sock,
            Err(e) => {
                error!(error = %e, "socket creation failed");
                panic!("socket creation failed: {e}");
            }
        };
        if let Err(e) = inner.set_nonblocking(true) {
            error!(error = %e, "set_nonblocking failed");
            panic!("set_nonblocking failed: {e}");
        }
        Self { inner }
    }

    pub(crate) fn from_socket2(inner: socket2::Socket) -> Self {
        Self { inner }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Bind to a local address. Failure is fatal: the caller asked for a
    /// specific endpoint and cannot serve without it.
    pub(crate) fn bind(&self, addr: &InetAddress) {
        let sockaddr = SockAddr::from(addr.to_socket_addr());
        if let Err(e) = self.inner.bind(&sockaddr) {
            error!(fd = self.fd(), addr = %addr, error = %e, "bind failed");
            panic!("bind {addr} failed: {e}");
        }
    }

    /// Start listening. Failure is fatal for the same reason as `bind`.
    pub(crate) fn listen(&self) {
        const BACKLOG: i32 = 1024;
        if let Err(e) = self.inner.listen(BACKLOG) {
            error!(fd = self.fd(), error = %e, "listen failed");
            panic!("listen failed: {e}");
        }
    }

    /// Accept one pending connection.
    ///
    /// The returned socket is close-on-exec (from the acceptance primitive)
    /// and is switched to non-blocking before it is handed out.
    pub(crate) fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let (sock, sockaddr) = self.inner.accept()?;
        sock.set_nonblocking(true)?;
        let peer = match sockaddr.as_socket() {
            Some(SocketAddr::V4(v4)) => InetAddress::from(v4),
            _ => {
                debug!(fd = sock.as_raw_fd(), "accepted peer without an IPv4 address");
                InetAddress::any(0)
            }
        };
        Ok((Socket::from_socket2(sock), peer))
    }

    /// Half-close the write direction; the read side keeps draining.
    pub(crate) fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            error!(fd = self.fd(), error = %e, "shutdown write failed");
        }
    }

    pub(crate) fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.inner.set_nodelay(on) {
            error!(fd = self.fd(), error = %e, "set TCP_NODELAY failed");
        }
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_address(on) {
            error!(fd = self.fd(), error = %e, "set SO_REUSEADDR failed");
        }
    }

    pub(crate) fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_port(on) {
            error!(fd = self.fd(), error = %e, "set SO_REUSEPORT failed");
        }
    }

    pub(crate) fn set_keepalive(&self, on: bool) {
        if let Err(e) = self.inner.set_keepalive(on) {
            error!(fd = self.fd(), error = %e, "set SO_KEEPALIVE failed");
        }
    }

    /// Fetch and clear the pending socket error (`SO_ERROR`).
    pub(crate) fn socket_error(&self) -> Option<io::Error> {
        match self.inner.take_error() {
            Ok(pending) => pending,
            Err(e) => Some(e),
        }
    }

    /// Kernel-assigned local address of the socket.
    pub(crate) fn local_addr(&self) -> io::Result<InetAddress> {
        match self.inner.local_addr()?.as_socket() {
            Some(SocketAddr::V4(v4)) => Ok(InetAddress::from(v4)),
            _ => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "socket has no IPv4 local address",
            )),
        }
    }

    /// Write directly to the socket; used for the optimistic send path.
    pub(crate) fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }
}
