//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device address, reading and device-list data model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Well-known Modbus TCP port.
pub const MODBUS_TCP_PORT: u16 = 502;

/// Network endpoint of a pollable field device.
///
/// The textual form is the join key used by the reading log and the
/// credential cache: the bare host when the port is [`MODBUS_TCP_PORT`],
/// `host:port` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress {
    pub host: IpAddr,
    pub port: u16,
}

impl DeviceAddress {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Filesystem- and identifier-safe rendering (`192_168_1_10`).
    pub fn slug(&self) -> String {
        self.to_string()
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
            .collect()
    }
}

impl From<SocketAddr> for DeviceAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == MODBUS_TCP_PORT {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}", self.socket_addr())
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid device address '{0}'")]
pub struct AddressParseError(pub String);

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(host) = trimmed.parse::<IpAddr>() {
            return Ok(Self::new(host, MODBUS_TCP_PORT));
        }
        trimmed
            .parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| AddressParseError(s.to_owned()))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.to_string()
    }
}

/// One decoded, timestamped snapshot of named parameters for one device.
///
/// A configured parameter is either present with a value or absent; there is
/// no partial state for a present key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub device: DeviceAddress,
    pub values: IndexMap<String, f32>,
}

impl Reading {
    pub fn new(device: DeviceAddress, values: IndexMap<String, f32>) -> Self {
        Self {
            timestamp: Utc::now(),
            device,
            values,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Entry of the persisted device list produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: String,
}

impl DiscoveredDevice {
    pub fn new(address: DeviceAddress, protocol: impl Into<String>) -> Self {
        Self {
            ip: address.host,
            port: address.port,
            protocol: protocol.into(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.ip, self.port)
    }
}
