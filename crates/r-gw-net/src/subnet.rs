//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::NetError;

/// IPv4 network in CIDR form. Host bits must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    /// Build a subnet, rejecting prefixes over 32 and set host bits.
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self, NetError> {
        let input = format!("{network}/{prefix}");
        if prefix > 32 {
            return Err(NetError::InvalidSubnet {
                input,
                reason: "prefix length exceeds 32".to_owned(),
            });
        }
        if u32::from(network) & !mask(prefix) != 0 {
            return Err(NetError::InvalidSubnet {
                input,
                reason: "host bits set".to_owned(),
            });
        }
        Ok(Self { network, prefix })
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Usable host addresses in ascending order. Network and broadcast
    /// addresses are excluded except for /31 and /32 networks.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network);
        let last = base | !mask(self.prefix);
        let (first, last) = if self.prefix >= 31 {
            (base, last)
        } else {
            (base + 1, last - 1)
        };
        (first..=last).map(Ipv4Addr::from)
    }
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| NetError::InvalidSubnet {
            input: s.to_owned(),
            reason: reason.to_owned(),
        };
        let trimmed = s.trim();
        let (addr, prefix) = match trimmed.split_once('/') {
            Some((addr, prefix)) => (
                addr,
                prefix
                    .parse::<u8>()
                    .map_err(|_| invalid("prefix length is not a number"))?,
            ),
            None => (trimmed, 32),
        };
        let network = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("not an IPv4 address"))?;
        Self::new(network, prefix).map_err(|err| match err {
            NetError::InvalidSubnet { reason, .. } => invalid(&reason),
            other => other,
        })
    }
}
