//! Allow list for inbound recon connections.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

/// A string that is not a valid CIDR network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CIDR {0:?}")]
pub struct CidrError(pub String);

impl Cidr {
    /// A network covering exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Cidr { addr, prefix }
    }

    /// Whether `ip` lies inside the network.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V4(net), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|ip| prefix_eq(&net.octets(), &ip.octets(), self.prefix)),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn prefix_eq(a: &[u8], b: &[u8], prefix: u8) -> bool {
    let full = usize::from(prefix / 8);
    if a[..full] != b[..full] {
        return false;
    }
    let rem = prefix % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    a[full] & mask == b[full] & mask
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, CidrError> {
        let err = || CidrError(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr = IpAddr::from_str(addr.trim()).map_err(|_| err())?;
        let max = Cidr::host(addr).prefix;
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| err())?,
            None => max,
        };
        if prefix > max {
            return Err(err());
        }
        Ok(Cidr { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Decides whether a remote address may open a session.  Loopback is always
/// allowed.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    nets: Vec<Cidr>,
}

impl IpMatcher {
    /// An empty matcher, allowing loopback only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows a network given in CIDR notation.
    pub fn allow_cidr(&mut self, cidr: &str) -> Result<(), CidrError> {
        self.nets.push(cidr.parse()?);
        Ok(())
    }

    /// Allows a single address.
    pub fn allow_ip(&mut self, ip: IpAddr) {
        if !self.matches(&ip) {
            self.nets.push(Cidr::host(ip));
        }
    }

    /// Allows the host part of every resolved partner address.
    pub fn allow_addrs(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            self.allow_ip(addr.ip());
        }
    }

    /// Whether `ip` may connect.
    pub fn matches(&self, ip: &IpAddr) -> bool {
        ip.is_loopback() || self.nets.iter().any(|net| net.contains(ip))
    }
}
