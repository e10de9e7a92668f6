//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-device connection state machine and polling loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Producer side: one connection state machine per device, polled in
//! discovery order on a fixed cadence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use r_gw_common::time::is_due;
use r_gw_common::{DeviceAddress, PollerConfig, Reading, RegisterPair};
use r_gw_net::{RegisterBlock, RegisterTransport, TransportConnector};
use r_gw_persistence::ReadingLogWriter;
use r_gw_rt::RateLimiter;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::error::PollerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// A connection attempt is in progress.
    Reconnecting,
}

/// Spacing and bound of connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            delay: config.reconnection_delay,
            max_attempts: config.max_reconnection_attempts,
        }
    }
}

/// Connection state machine for one device.
pub struct DeviceConnection {
    device: DeviceAddress,
    state: ConnectionState,
    attempts: u32,
    last_attempt: Option<Instant>,
    exhausted: bool,
    transport: Option<Box<dyn RegisterTransport>>,
}

impl DeviceConnection {
    pub fn new(device: DeviceAddress) -> Self {
        Self {
            device,
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_attempt: None,
            exhausted: false,
            transport: None,
        }
    }

    pub fn device(&self) -> DeviceAddress {
        self.device
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the device has been given up on for this process lifetime.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Open the transport. Success resets the attempt counter.
    pub async fn connect(&mut self, connector: &dyn TransportConnector) -> bool {
        match connector.connect(self.device).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                info!(device = %self.device, "device connected");
                true
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                warn!(device = %self.device, error = %err, "device connection failed");
                false
            }
        }
    }

    /// Make the device usable at `now` if possible: connected devices pass
    /// straight through, exhausted ones never do, otherwise an attempt is
    /// made once the reconnection delay since the last attempt has elapsed.
    pub async fn ensure_connected(
        &mut self,
        connector: &dyn TransportConnector,
        policy: ReconnectPolicy,
        now: Instant,
    ) -> bool {
        if self.state == ConnectionState::Connected {
            return true;
        }
        if self.exhausted || !is_due(self.last_attempt, now, policy.delay) {
            return false;
        }

        self.state = ConnectionState::Reconnecting;
        self.attempts += 1;
        self.last_attempt = Some(now);
        let attempt = self.attempts;
        debug!(device = %self.device, attempt, max = policy.max_attempts, "connection attempt");
        if self.connect(connector).await {
            return true;
        }
        if attempt >= policy.max_attempts {
            self.exhausted = true;
            error!(
                device = %self.device,
                attempts = attempt,
                "reconnection attempts exhausted; device skipped until restart"
            );
        }
        false
    }

    /// Read a register block; any failure drops the connection.
    pub async fn read_block(&mut self, start: u16, count: u16) -> Option<RegisterBlock> {
        let transport = self.transport.as_mut()?;
        match transport.read_input_registers(start, count).await {
            Ok(values) => Some(RegisterBlock::new(start, values)),
            Err(err) => {
                warn!(device = %self.device, error = %err, "register read failed; disconnecting");
                self.disconnect().await;
                None
            }
        }
    }

    /// Close the transport, if open, and go `Disconnected`.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.state = ConnectionState::Disconnected;
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Polls every device once per interval and appends readings to the log.
pub struct Poller {
    connector: Arc<dyn TransportConnector>,
    devices: Vec<DeviceConnection>,
    policy: ReconnectPolicy,
    interval: Duration,
    register_start: u16,
    register_count: u16,
    register_number_base: u16,
    parameters: IndexMap<String, RegisterPair>,
    all_exhausted_logged: bool,
}

impl Poller {
    /// Devices are polled in the order given.
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        devices: impl IntoIterator<Item = DeviceAddress>,
        config: &PollerConfig,
    ) -> Self {
        Self {
            connector,
            devices: devices.into_iter().map(DeviceConnection::new).collect(),
            policy: ReconnectPolicy::from_config(config),
            interval: config.poll_interval,
            register_start: config.register_start,
            register_count: config.register_count,
            register_number_base: config.register_number_base,
            parameters: config.parameters.clone(),
            all_exhausted_logged: false,
        }
    }

    pub fn devices(&self) -> &[DeviceConnection] {
        &self.devices
    }

    /// Poll the device at `index`, returning its reading on success.
    pub async fn poll_device(&mut self, index: usize, now: Instant) -> Option<Reading> {
        let connector = Arc::clone(&self.connector);
        let policy = self.policy;
        let (start, count, base) = (
            self.register_start,
            self.register_count,
            self.register_number_base,
        );
        let connection = self.devices.get_mut(index)?;
        if !connection
            .ensure_connected(connector.as_ref(), policy, now)
            .await
        {
            return None;
        }
        let block = connection.read_block(start, count).await?;
        let device = connection.device();

        let decoded = block.decode(&self.parameters, base);
        for omitted in &decoded.out_of_range {
            warn!(
                device = %device,
                parameter = %omitted.parameter,
                high = omitted.registers.high,
                low = omitted.registers.low,
                "register outside polled block; parameter omitted"
            );
        }
        let reading = Reading::new(device, decoded.values);
        debug!(device = %device, values = ?reading.values, "reading decoded");
        Some(reading)
    }

    /// One pass over every device in order.
    pub async fn poll_cycle(&mut self) -> Vec<Reading> {
        let mut readings = Vec::new();
        for index in 0..self.devices.len() {
            if let Some(reading) = self.poll_device(index, Instant::now()).await {
                readings.push(reading);
            }
        }
        readings
    }

    /// Close every open transport.
    pub async fn close_all(&mut self) {
        for connection in &mut self.devices {
            connection.disconnect().await;
        }
        debug!(devices = self.devices.len(), "all device transports closed");
    }

    /// Poll until shutdown, appending each reading to `log`. The first tick
    /// is immediate and makes the initial connection attempts. On shutdown
    /// the device currently being polled finishes its I/O first, including
    /// during those initial attempts. A log failure is fatal.
    pub async fn run(
        mut self,
        mut log: ReadingLogWriter,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), PollerError> {
        let mut limiter = RateLimiter::new(self.interval);
        info!(devices = self.devices.len(), interval_ms = self.interval.as_millis() as u64, "poller started");

        let outcome = 'poll: loop {
            tokio::select! {
                _ = shutdown.recv() => break 'poll Ok(()),
                _ = limiter.tick() => {}
            }

            for index in 0..self.devices.len() {
                if shutdown_requested(&mut shutdown) {
                    break 'poll Ok(());
                }
                if let Some(reading) = self.poll_device(index, Instant::now()).await {
                    if let Err(err) = log.append(&reading) {
                        error!(device = %reading.device, error = %err, "reading log append failed");
                        break 'poll Err(PollerError::from(err));
                    }
                }
            }
            self.note_exhaustion();
        };

        self.close_all().await;
        info!("poller stopped");
        outcome
    }

    fn note_exhaustion(&mut self) {
        if !self.all_exhausted_logged
            && !self.devices.is_empty()
            && self.devices.iter().all(DeviceConnection::is_exhausted)
        {
            self.all_exhausted_logged = true;
            error!(devices = self.devices.len(), "every device exhausted its reconnection attempts");
        }
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("devices", &self.devices)
            .field("interval", &self.interval)
            .finish()
    }
}
