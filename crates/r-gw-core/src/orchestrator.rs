//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Gateway startup, task supervision and shutdown."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use r_gw_common::{AppConfig, DeviceAddress, DiscoveredDevice};
use r_gw_net::{
    DiscoveryScanner, Ipv4Subnet, ModbusTcpConnector, ProbeRegistry, ScanSettings,
    TransportConnector,
};
use r_gw_persistence::{
    load_device_list, save_device_list, CredentialCache, CursorStore, ReadingLogReader,
    ReadingLogWriter,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ForwarderError, PollerError};
use crate::forwarder::Forwarder;
use crate::platform::{IngestionPlatform, ThingsBoardClient};
use crate::poller::Poller;
use crate::watcher::LogWatcher;

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    PollOnly,
    ForwardOnly,
}

impl RunMode {
    pub fn polls(self) -> bool {
        matches!(self, RunMode::Full | RunMode::PollOnly)
    }

    pub fn forwards(self) -> bool {
        matches!(self, RunMode::Full | RunMode::ForwardOnly)
    }
}

/// Scan the configured subnet and persist the resulting device list.
pub async fn discover_devices(
    config: &AppConfig,
    registry: &ProbeRegistry,
) -> Result<Vec<DiscoveredDevice>> {
    let discovery = &config.discovery;
    let subnet: Ipv4Subnet = discovery
        .subnet
        .parse()
        .with_context(|| format!("invalid discovery.subnet '{}'", discovery.subnet))?;
    let scanner = DiscoveryScanner::new(registry.clone(), ScanSettings::from_config(discovery));
    let devices = scanner.discover(&subnet, &discovery.protocol).await?;
    save_device_list(&discovery.devices_file, &devices).with_context(|| {
        format!(
            "failed to write device list {}",
            discovery.devices_file.display()
        )
    })?;
    info!(devices = devices.len(), path = %discovery.devices_file.display(), "device list saved");
    Ok(devices)
}

/// Load a saved device list, keeping only entries with a registered protocol.
/// Repeated addresses keep their first position.
pub fn load_devices(path: &Path, registry: &ProbeRegistry) -> Result<Vec<DeviceAddress>> {
    let entries = load_device_list(path)
        .with_context(|| format!("failed to read device list {}", path.display()))?;
    let mut devices = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();
    for entry in entries {
        if !registry.supports(&entry.protocol) {
            warn!(device = %entry.address(), protocol = %entry.protocol, "unsupported protocol; device ignored");
        } else if seen.insert(entry.address()) {
            devices.push(entry.address());
        } else {
            warn!(device = %entry.address(), "duplicate device list entry ignored");
        }
    }
    Ok(devices)
}

/// Starts the poller and forwarder tasks.
pub struct GatewayOrchestrator {
    config: Arc<AppConfig>,
    connector: Arc<dyn TransportConnector>,
    platform: Arc<dyn IngestionPlatform>,
}

impl GatewayOrchestrator {
    /// Orchestrator talking Modbus TCP to devices and HTTP to ThingsBoard.
    pub fn new(config: AppConfig) -> Result<Self> {
        let connector = Arc::new(ModbusTcpConnector::from_config(&config.poller));
        let platform = Arc::new(
            ThingsBoardClient::from_config(&config.platform)
                .context("failed to build platform client")?,
        );
        Ok(Self::with_components(config, connector, platform))
    }

    pub fn with_components(
        config: AppConfig,
        connector: Arc<dyn TransportConnector>,
        platform: Arc<dyn IngestionPlatform>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            platform,
        }
    }

    /// Open storage and spawn the requested components. Storage problems
    /// (schema mismatch, malformed credential cache) fail here, before any
    /// task starts.
    pub async fn start(self, devices: Vec<DeviceAddress>, mode: RunMode) -> Result<GatewayHandle> {
        let (shutdown_tx, _) = broadcast::channel(4);
        let stopped = shutdown_tx.subscribe();
        let storage = &self.config.storage;
        let parameters = self.config.poller.parameter_names();

        let poller = if mode.polls() {
            if devices.is_empty() {
                bail!("no devices to poll");
            }
            let writer = ReadingLogWriter::open(&storage.log_path, &parameters).with_context(|| {
                format!("failed to open reading log {}", storage.log_path.display())
            })?;
            let poller = Poller::new(self.connector.clone(), devices, &self.config.poller);
            let shutdown = shutdown_tx.subscribe();
            let notify = shutdown_tx.clone();
            Some(tokio::spawn(async move {
                let result = poller.run(writer, shutdown).await;
                if let Err(err) = &result {
                    error!(error = %err, "poller failed");
                }
                let _ = notify.send(());
                result
            }))
        } else {
            None
        };

        let forwarder = if mode.forwards() {
            let cache = CredentialCache::load(&storage.credential_cache_path).with_context(|| {
                format!(
                    "failed to load credential cache {}",
                    storage.credential_cache_path.display()
                )
            })?;
            let forwarder = Forwarder::new(
                self.platform.clone(),
                ReadingLogReader::new(&storage.log_path, &parameters),
                CursorStore::new(&storage.cursor_path),
                cache,
                self.config.platform.device_type.clone(),
            )
            .context("failed to initialise forwarder")?;
            let trigger = LogWatcher::new(
                &storage.log_path,
                self.config.forwarder.debounce,
                self.config.forwarder.fallback_interval,
            );
            let shutdown = shutdown_tx.subscribe();
            let notify = shutdown_tx.clone();
            Some(tokio::spawn(async move {
                let result = forwarder.run(trigger, shutdown).await;
                if let Err(err) = &result {
                    error!(error = %err, "forwarder failed");
                }
                let _ = notify.send(());
                result
            }))
        } else {
            None
        };

        info!(mode = ?mode, "gateway started");
        Ok(GatewayHandle {
            shutdown: shutdown_tx,
            stopped,
            poller,
            forwarder,
        })
    }
}

impl std::fmt::Debug for GatewayOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayOrchestrator")
            .field("log", &self.config.storage.log_path)
            .finish()
    }
}

/// Lifecycle handle for running gateway components.
#[derive(Debug)]
pub struct GatewayHandle {
    shutdown: broadcast::Sender<()>,
    stopped: broadcast::Receiver<()>,
    poller: Option<JoinHandle<Result<(), PollerError>>>,
    forwarder: Option<JoinHandle<Result<(), ForwarderError>>>,
}

impl GatewayHandle {
    /// Resolves once any component has stopped or shutdown was requested.
    pub async fn stopped(&mut self) {
        let _ = self.stopped.recv().await;
    }

    /// Signal every component, wait for them, and report the first failure.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        let poller = join_component("poller", self.poller).await;
        let forwarder = join_component("forwarder", self.forwarder).await;
        info!("gateway shutdown complete");
        poller.and(forwarder)
    }
}

async fn join_component<E>(name: &str, task: Option<JoinHandle<Result<(), E>>>) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match task {
        None => Ok(()),
        Some(task) => match task.await {
            Ok(result) => result.with_context(|| format!("{name} stopped with an error")),
            Err(err) => {
                warn!(component = name, error = %err, "component task join failure");
                Err(anyhow::anyhow!("{name} task join error: {err}"))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_modes_select_components() {
        assert!(RunMode::Full.polls() && RunMode::Full.forwards());
        assert!(RunMode::PollOnly.polls() && !RunMode::PollOnly.forwards());
        assert!(!RunMode::ForwardOnly.polls() && RunMode::ForwardOnly.forwards());
    }

    #[test]
    fn saved_list_keeps_registered_protocols_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connected_devices.json");
        let modbus: DeviceAddress = "192.168.1.10".parse().unwrap();
        let other: DeviceAddress = "192.168.1.11".parse().unwrap();
        save_device_list(
            &path,
            &[
                DiscoveredDevice::new(modbus, "modbus"),
                DiscoveredDevice::new(other, "bacnet"),
            ],
        )
        .unwrap();

        let devices = load_devices(&path, &ProbeRegistry::with_builtin(1)).unwrap();
        assert_eq!(devices, vec![modbus]);
    }

    #[test]
    fn repeated_entries_are_polled_once_in_first_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connected_devices.json");
        let first: DeviceAddress = "192.168.1.20".parse().unwrap();
        let second: DeviceAddress = "192.168.1.10".parse().unwrap();
        save_device_list(
            &path,
            &[
                DiscoveredDevice::new(first, "modbus"),
                DiscoveredDevice::new(second, "modbus"),
                DiscoveredDevice::new(first, "modbus"),
            ],
        )
        .unwrap();

        let devices = load_devices(&path, &ProbeRegistry::with_builtin(1)).unwrap();
        assert_eq!(devices, vec![first, second]);
    }
}
