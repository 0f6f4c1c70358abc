//! Network Origin Whitelist
//!
//! CIDR-based admission policy and client address resolution.

use axum::http::HeaderMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WhitelistError {
    #[error("Invalid CIDR notation '{0}'")]
    InvalidCidr(String),
}

/// An IPv4 or IPv6 network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => v4_matches(net, ip, self.prefix),
            (IpAddr::V6(net), IpAddr::V6(ip)) => v6_matches(net, ip, self.prefix),
            (IpAddr::V4(net), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .map(|ip| v4_matches(net, ip, self.prefix))
                .unwrap_or(false),
            (IpAddr::V6(net), IpAddr::V4(ip)) => v6_matches(net, ip.to_ipv6_mapped(), self.prefix),
        }
    }
}

fn v4_matches(net: Ipv4Addr, ip: Ipv4Addr, prefix: u8) -> bool {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    u32::from(net) & mask == u32::from(ip) & mask
}

fn v6_matches(net: Ipv6Addr, ip: Ipv6Addr, prefix: u8) -> bool {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    u128::from(net) & mask == u128::from(ip) & mask
}

impl FromStr for Cidr {
    type Err = WhitelistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || WhitelistError::InvalidCidr(s.to_string());

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Admission policy over client addresses
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    enabled: bool,
    networks: Vec<Cidr>,
}

impl Whitelist {
    /// Parse the configured networks; they are ignored when `enabled` is false
    pub fn new<S: AsRef<str>>(enabled: bool, networks: &[S]) -> Result<Self, WhitelistError> {
        let networks = if enabled {
            networks
                .iter()
                .map(|n| n.as_ref().parse())
                .collect::<Result<Vec<Cidr>, _>>()?
        } else {
            Vec::new()
        };
        Ok(Self { enabled, networks })
    }

    /// A policy that admits everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn networks(&self) -> &[Cidr] {
        &self.networks
    }

    /// Check a resolved client address
    ///
    /// Unparseable addresses are rejected while the whitelist is enabled.
    pub fn is_allowed(&self, client_addr: &str) -> bool {
        if !self.enabled {
            return true;
        }
        match parse_client_ip(client_addr) {
            Some(ip) => self.networks.iter().any(|n| n.contains(ip)),
            None => {
                tracing::warn!(addr = %client_addr, "Failed to parse client address");
                false
            }
        }
    }
}

/// The address a request originated from
///
/// Prefers the first `X-Forwarded-For` entry, falling back to the peer
/// socket address.
pub fn resolve_client_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

/// Parse `ip`, `ipv4:port` or `[ipv6]:port`
pub fn parse_client_ip(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip);
    }
    addr.parse::<SocketAddr>().ok().map(|sa| sa.ip())
}
