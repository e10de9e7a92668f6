//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Network edge of the gateway: finding devices on a subnet, talking to them
//! over Modbus TCP and turning raw register blocks into named values.
#![warn(missing_docs)]

pub mod adapters;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod subnet;

pub use adapters::modbus::{ModbusProbe, ModbusTcpConnector, ModbusTcpTransport};
pub use adapters::{LivenessProbe, ProbeRegistry, RegisterTransport, TransportConnector};
pub use codec::{
    f32_to_registers, registers_to_f32, DecodedBlock, OutOfRangeParameter, RegisterBlock,
};
pub use discovery::{ConnectivityCheck, DiscoveryScanner, ScanSettings, TcpConnectivityCheck};
pub use error::NetError;
pub use subnet::Ipv4Subnet;
