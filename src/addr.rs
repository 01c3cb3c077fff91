//! IPv4 endpoint value type used across the public API.
//!
//! The engine speaks IPv4 only; a [`NetAddress`] is a 32-bit host address
//! plus a 16-bit port with bitwise equality. The all-zero address doubles as
//! the "unset" sentinel, e.g. a profile that has no explicit local bind.

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// An IPv4 host + port endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    ip: [u8; 4],
    port: u16,
}

/// The unset sentinel: `0.0.0.0:0`.
pub const UNSET: NetAddress = NetAddress { ip: [0; 4], port: 0 };

impl NetAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        NetAddress {
            ip: ip.octets(),
            port,
        }
    }

    /// Parse `"a.b.c.d"` plus a port. Fails on anything that is not a
    /// literal IPv4 address; use [`resolve`] for host names.
    pub fn parse(ip: &str, port: u16) -> Result<Self> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| NetError::InvalidProfile(format!("not an IPv4 address: {ip:?}")))?;
        Ok(NetAddress::new(ip, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this is the all-zero sentinel.
    pub fn is_unset(&self) -> bool {
        *self == UNSET
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl From<NetAddress> for SocketAddr {
    fn from(addr: NetAddress) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(addr.ip(), addr.port))
    }
}

impl TryFrom<SocketAddr> for NetAddress {
    type Error = NetError;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(NetAddress::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => Err(NetError::InvalidProfile(
                "IPv6 endpoints are not supported".into(),
            )),
        }
    }
}

/// Resolve a host name (or address literal) to its first IPv4 endpoint.
///
/// Blocking DNS lookup via the system resolver.
pub fn resolve(host: &str, port: u16) -> Result<NetAddress> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(NetAddress::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| NetError::Protocol(format!("{host} has no IPv4 address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let addr = NetAddress::parse("192.168.0.7", 6083).unwrap();
        assert_eq!(addr.to_string(), "192.168.0.7:6083");
        assert_eq!(addr.port(), 6083);
        assert!(!addr.is_unset());
    }

    #[test]
    fn unset_sentinel() {
        assert!(UNSET.is_unset());
        assert!(!NetAddress::parse("0.0.0.0", 1).unwrap().is_unset());
        assert_eq!(UNSET, NetAddress::new(Ipv4Addr::UNSPECIFIED, 0));
    }

    #[test]
    fn rejects_hostnames_and_v6() {
        assert!(NetAddress::parse("localhost", 80).is_err());
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(NetAddress::try_from(v6).is_err());
    }

    #[test]
    fn socket_addr_conversions() {
        let addr = NetAddress::parse("127.0.0.1", 9001).unwrap();
        let sock: SocketAddr = addr.into();
        assert_eq!(NetAddress::try_from(sock).unwrap(), addr);
    }

    #[test]
    fn resolve_literal() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addr, NetAddress::parse("127.0.0.1", 80).unwrap());
    }
}
