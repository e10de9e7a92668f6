//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use r_gw_common::DeviceAddress;
use tracing::{debug, info};

use crate::fsutil::write_atomic;
use crate::Result;

/// Device address to access token map, mirrored to a pretty-printed JSON
/// object that operators may edit by hand.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    path: PathBuf,
    entries: BTreeMap<DeviceAddress, String>,
}

impl CredentialCache {
    /// Load the cache from `path`. A missing file is an empty cache; an
    /// unreadable or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(cache = %path.display(), "no credential cache yet, starting empty");
                BTreeMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        let cache = Self {
            path: path.to_path_buf(),
            entries,
        };
        debug!(cache = %path.display(), entries = cache.len(), "credential cache loaded");
        Ok(cache)
    }

    /// Token for `device`, if provisioned.
    pub fn get(&self, device: &DeviceAddress) -> Option<&str> {
        self.entries.get(device).map(String::as_str)
    }

    /// Record a token in memory. Call [`persist`](Self::persist) to make it durable.
    pub fn insert(&mut self, device: DeviceAddress, token: impl Into<String>) {
        self.entries.insert(device, token.into());
    }

    /// Write the whole cache atomically.
    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        write_atomic(&self.path, &json)
    }

    /// Number of cached devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no device has been provisioned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let mut cache = CredentialCache::load(&path).unwrap();
        assert!(cache.is_empty());

        let device: DeviceAddress = "192.168.1.10".parse().unwrap();
        cache.insert(device, "tok-10");
        cache.persist().unwrap();

        let reloaded = CredentialCache::load(&path).unwrap();
        assert_eq!(reloaded.get(&device), Some("tok-10"));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"192.168.1.10\": \"tok-10\""));
    }

    #[test]
    fn hand_edited_file_is_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, r#"{ "10.0.0.5:1502": "abc" }"#).unwrap();
        let cache = CredentialCache::load(&path).unwrap();
        assert_eq!(cache.get(&"10.0.0.5:1502".parse().unwrap()), Some("abc"));
    }

    #[test]
    fn malformed_cache_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{ broken").unwrap();
        assert!(CredentialCache::load(&path).is_err());
    }
}
