//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use r_gw_common::DiscoveredDevice;

use crate::fsutil::write_atomic;
use crate::Result;

/// Persist the discovered device list as a JSON array.
pub fn save_device_list(path: &Path, devices: &[DiscoveredDevice]) -> Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(devices)?)
}

/// Load a device list written by [`save_device_list`].
pub fn load_device_list(path: &Path) -> Result<Vec<DiscoveredDevice>> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}
