//! IPv4 socket address wrapper.
//!
//! The library is IPv4-only by design; every address that crosses the API
//! boundary is an [`InetAddress`].

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tracing::error;

/// An IPv4 address/port pair.
///
/// Construction from text fails loudly: a malformed address is a
/// programmer error, not a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddress {
    addr: SocketAddrV4,
}

impl InetAddress {
    /// Build an address from a port and a dotted-quad IP string.
    ///
    /// # Panics
    /// Panics if `ip` is not a valid IPv4 textual address.
    pub fn new(port: u16, ip: &str) -> Self {
        match ip.parse::<Ipv4Addr>() {
            Ok(parsed) => Self {
                addr: SocketAddrV4::new(parsed, port),
            },
            Err(e) => {
                error!(ip, port, error = %e, "invalid IPv4 address");
                panic!("invalid IPv4 address {ip:?}:{port}");
            }
        }
    }

    /// Loopback address on the given port.
    pub fn localhost(port: u16) -> Self {
        Self {
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        }
    }

    /// Wildcard address (`0.0.0.0`) on the given port.
    pub fn any(port: u16) -> Self {
        Self {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Render as `"a.b.c.d:port"`.
    pub fn to_ip_port(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(self.addr)
    }
}

impl From<SocketAddrV4> for InetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self { addr }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}
