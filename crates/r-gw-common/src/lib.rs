//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the R-EMS field gateway.
//! This crate exposes the reading data model, configuration loading and
//! logging setup consumed across the workspace.

pub mod config;
pub mod logging;
pub mod model;
pub mod time;

pub use config::{
    AppConfig, DiscoveryConfig, ForwarderConfig, LoggingConfig, PlatformConfig, PollerConfig,
    RegisterPair, StorageConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use model::{AddressParseError, DeviceAddress, DiscoveredDevice, Reading, MODBUS_TCP_PORT};
