//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Two stage subnet discovery: a bounded, batched TCP connectivity sweep
//! followed by a sequential protocol liveness probe of every responder.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_gw_common::{DeviceAddress, DiscoveredDevice, DiscoveryConfig};
use r_gw_rt::BoundedBatchExecutor;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::adapters::ProbeRegistry;
use crate::error::NetError;
use crate::subnet::Ipv4Subnet;

/// First stage check: does the host accept a connection on the port?
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    /// `true` when a connection to `device` is established within `limit`.
    async fn is_reachable(&self, device: DeviceAddress, limit: Duration) -> bool;
}

/// Plain TCP connect; the stream is dropped immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectivityCheck;

#[async_trait]
impl ConnectivityCheck for TcpConnectivityCheck {
    async fn is_reachable(&self, device: DeviceAddress, limit: Duration) -> bool {
        matches!(
            timeout(limit, TcpStream::connect(device.socket_addr())).await,
            Ok(Ok(_))
        )
    }
}

/// Tunables for one discovery run.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Port every host is checked on.
    pub port: u16,
    /// Bound on each connectivity check.
    pub connect_timeout: Duration,
    /// Bound on each liveness probe attempt.
    pub probe_timeout: Duration,
    /// Liveness probe attempts per host.
    pub probe_retries: u32,
    /// Maximum simultaneous connectivity checks.
    pub max_in_flight: usize,
}

impl ScanSettings {
    /// Settings from the discovery section of the configuration.
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            port: config.port,
            connect_timeout: config.scan_timeout,
            probe_timeout: config.probe_timeout,
            probe_retries: config.probe_retries,
            max_in_flight: config.max_in_flight,
        }
    }
}

/// Finds protocol-speaking devices on a subnet.
pub struct DiscoveryScanner {
    connectivity: Arc<dyn ConnectivityCheck>,
    probes: ProbeRegistry,
    settings: ScanSettings,
}

impl DiscoveryScanner {
    /// Scanner using plain TCP connects for the first stage.
    pub fn new(probes: ProbeRegistry, settings: ScanSettings) -> Self {
        Self::with_connectivity(Arc::new(TcpConnectivityCheck), probes, settings)
    }

    /// Scanner with a custom first stage check.
    pub fn with_connectivity(
        connectivity: Arc<dyn ConnectivityCheck>,
        probes: ProbeRegistry,
        settings: ScanSettings,
    ) -> Self {
        Self {
            connectivity,
            probes,
            settings,
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Hosts of `subnet` accepting connections on the configured port, in
    /// ascending order. Checks run in batches of `max_in_flight`; every
    /// check has completed when this returns.
    pub async fn reachable_hosts(&self, subnet: &Ipv4Subnet) -> Result<Vec<DeviceAddress>, NetError> {
        let mut executor = BoundedBatchExecutor::new(self.settings.max_in_flight);
        let limit = self.settings.connect_timeout;
        for host in subnet.hosts() {
            let device = DeviceAddress::new(IpAddr::V4(host), self.settings.port);
            let check = Arc::clone(&self.connectivity);
            executor
                .spawn(async move { check.is_reachable(device, limit).await.then_some(device) })
                .await?;
        }
        let reachable: BTreeSet<DeviceAddress> =
            executor.join().await?.into_iter().flatten().collect();
        debug!(subnet = %subnet, port = self.settings.port, responders = reachable.len(), "connectivity sweep finished");
        Ok(reachable.into_iter().collect())
    }

    /// Full discovery for `protocol`. An unregistered protocol is logged and
    /// yields no devices.
    pub async fn discover(
        &self,
        subnet: &Ipv4Subnet,
        protocol: &str,
    ) -> Result<Vec<DiscoveredDevice>, NetError> {
        let probe = match self.probes.resolve(protocol) {
            Ok(probe) => probe,
            Err(err) => {
                error!(protocol, error = %err, "discovery skipped");
                return Ok(Vec::new());
            }
        };

        info!(subnet = %subnet, port = self.settings.port, protocol, "scanning subnet");
        let mut confirmed = Vec::new();
        for device in self.reachable_hosts(subnet).await? {
            if probe
                .probe(device, self.settings.probe_timeout, self.settings.probe_retries)
                .await
            {
                info!(device = %device, protocol, "device confirmed");
                confirmed.push(DiscoveredDevice::new(device, protocol));
            } else {
                debug!(device = %device, protocol, "host reachable but failed liveness probe");
            }
        }
        info!(subnet = %subnet, protocol, devices = confirmed.len(), "discovery finished");
        Ok(confirmed)
    }
}

impl std::fmt::Debug for DiscoveryScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryScanner")
            .field("probes", &self.probes)
            .field("settings", &self.settings)
            .finish()
    }
}
