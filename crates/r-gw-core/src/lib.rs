//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Gateway pipeline crate: poller, forwarder, platform client and orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Acquisition and forwarding pipeline of the gateway: the per-device poller,
//! the ingestion platform client, the log-tailing forwarder and the
//! orchestrator tying them together.

pub mod error;
pub mod forwarder;
pub mod orchestrator;
pub mod platform;
pub mod poller;
pub mod watcher;

pub use error::{ForwarderError, PlatformError, PollerError};
pub use forwarder::{BatchReport, DeliveryOutcome, Forwarder, TelemetryPayload};
pub use orchestrator::{
    discover_devices, load_devices, GatewayHandle, GatewayOrchestrator, RunMode,
};
pub use platform::{device_name, provision_device, IngestionPlatform, ThingsBoardClient};
pub use poller::{ConnectionState, DeviceConnection, Poller, ReconnectPolicy};
pub use watcher::{LogWatcher, Trigger};
