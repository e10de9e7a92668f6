//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_gw_common::DeviceAddress;

use crate::error::NetError;

/// Open connection to one device able to read input registers.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Read `count` input registers starting at protocol address `start`.
    async fn read_input_registers(&mut self, start: u16, count: u16)
        -> Result<Vec<u16>, NetError>;

    /// Release the underlying connection. Further reads fail.
    async fn close(&mut self) {}
}

/// Factory for [`RegisterTransport`]s.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a transport to `device`, bounded by the connector's connect timeout.
    async fn connect(&self, device: DeviceAddress) -> Result<Box<dyn RegisterTransport>, NetError>;
}

/// Protocol-specific check that a host actually speaks the protocol.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns `true` when the device answered within `timeout` on any of
    /// `retries` attempts (at least one attempt is always made).
    async fn probe(&self, device: DeviceAddress, timeout: Duration, retries: u32) -> bool;
}

/// Static registry resolving protocol identifiers to liveness probes.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: BTreeMap<String, Arc<dyn LivenessProbe>>,
}

impl ProbeRegistry {
    /// Registry with no probes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in protocol (`modbus`).
    pub fn with_builtin(unit_id: u8) -> Self {
        let mut registry = Self::empty();
        registry.register("modbus", Arc::new(modbus::ModbusProbe::new(unit_id)));
        registry
    }

    /// Register `probe` under `protocol`, replacing any previous entry.
    pub fn register(&mut self, protocol: impl Into<String>, probe: Arc<dyn LivenessProbe>) {
        self.probes.insert(protocol.into(), probe);
    }

    /// Resolve the probe for `protocol`.
    pub fn resolve(&self, protocol: &str) -> Result<Arc<dyn LivenessProbe>, NetError> {
        self.probes
            .get(protocol)
            .cloned()
            .ok_or_else(|| NetError::UnsupportedProtocol(protocol.to_owned()))
    }

    /// Whether `protocol` is registered.
    pub fn supports(&self, protocol: &str) -> bool {
        self.probes.contains_key(protocol)
    }

    /// Registered protocol identifiers, sorted.
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.probes.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("protocols", &self.probes.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub mod modbus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_is_typed_error() {
        let registry = ProbeRegistry::with_builtin(1);
        assert!(registry.supports("modbus"));
        assert_eq!(registry.protocols().collect::<Vec<_>>(), vec!["modbus"]);
        match registry.resolve("bacnet") {
            Err(NetError::UnsupportedProtocol(name)) => assert_eq!(name, "bacnet"),
            other => panic!("unexpected resolution: {:?}", other.map(|_| ())),
        }
    }
}
