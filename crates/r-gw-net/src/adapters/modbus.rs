//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use r_gw_common::time::duration_to_millis;
use r_gw_common::{DeviceAddress, PollerConfig};
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, trace};

use super::{LivenessProbe, RegisterTransport, TransportConnector};
use crate::error::NetError;

/// Opens Modbus TCP connections with bounded connect and read times.
#[derive(Debug, Clone)]
pub struct ModbusTcpConnector {
    unit_id: u8,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ModbusTcpConnector {
    /// Build a connector addressing `unit_id` on every device.
    pub fn new(unit_id: u8, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            unit_id,
            connect_timeout,
            read_timeout,
        }
    }

    /// Build a connector from the poller section of the configuration.
    pub fn from_config(config: &PollerConfig) -> Self {
        Self::new(config.unit_id, config.connect_timeout, config.read_timeout)
    }
}

async fn open_context(
    device: DeviceAddress,
    unit_id: u8,
    connect_timeout: Duration,
) -> Result<Context, NetError> {
    match timeout(
        connect_timeout,
        tcp::connect_slave(device.socket_addr(), Slave(unit_id)),
    )
    .await
    {
        Ok(Ok(ctx)) => Ok(ctx),
        Ok(Err(source)) => Err(NetError::Connect { device, source }),
        Err(_) => Err(NetError::Timeout {
            device,
            operation: "connect",
            timeout_ms: duration_to_millis(connect_timeout),
        }),
    }
}

async fn read_block(
    ctx: &mut Context,
    device: DeviceAddress,
    start: u16,
    count: u16,
    read_timeout: Duration,
) -> Result<Vec<u16>, NetError> {
    let response = timeout(read_timeout, ctx.read_input_registers(start, count))
        .await
        .map_err(|_| NetError::Timeout {
            device,
            operation: "read",
            timeout_ms: duration_to_millis(read_timeout),
        })?;
    response
        .map_err(|err| NetError::Transport {
            device,
            message: err.to_string(),
        })?
        .map_err(|code| NetError::Exception {
            device,
            code: format!("{:?}", code),
        })
}

#[async_trait]
impl TransportConnector for ModbusTcpConnector {
    async fn connect(&self, device: DeviceAddress) -> Result<Box<dyn RegisterTransport>, NetError> {
        let ctx = open_context(device, self.unit_id, self.connect_timeout).await?;
        debug!(device = %device, unit_id = self.unit_id, "modbus transport opened");
        Ok(Box::new(ModbusTcpTransport {
            device,
            ctx: Some(ctx),
            read_timeout: self.read_timeout,
        }))
    }
}

/// Live Modbus TCP session with one device.
pub struct ModbusTcpTransport {
    device: DeviceAddress,
    ctx: Option<Context>,
    read_timeout: Duration,
}

impl std::fmt::Debug for ModbusTcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpTransport")
            .field("device", &self.device)
            .field("open", &self.ctx.is_some())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, NetError> {
        let device = self.device;
        let ctx = self.ctx.as_mut().ok_or(NetError::Closed(device))?;
        let values = read_block(ctx, device, start, count, self.read_timeout).await?;
        if values.len() < usize::from(count) {
            return Err(NetError::ShortRead {
                device,
                expected: usize::from(count),
                actual: values.len(),
            });
        }
        trace!(device = %device, start, count, "input registers read");
        Ok(values)
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
            debug!(device = %self.device, "modbus transport closed");
        }
    }
}

/// Liveness probe that opens a session and reads a single input register.
/// Any framed answer, data or exception, proves the host speaks Modbus.
#[derive(Debug, Clone)]
pub struct ModbusProbe {
    unit_id: u8,
}

impl ModbusProbe {
    /// Probe addressing `unit_id`.
    pub fn new(unit_id: u8) -> Self {
        Self { unit_id }
    }

    async fn attempt(&self, device: DeviceAddress, limit: Duration) -> Result<(), NetError> {
        let mut ctx = open_context(device, self.unit_id, limit).await?;
        let outcome = read_block(&mut ctx, device, 0, 1, limit).await;
        let _ = ctx.disconnect().await;
        match outcome {
            Ok(_) | Err(NetError::Exception { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl LivenessProbe for ModbusProbe {
    async fn probe(&self, device: DeviceAddress, limit: Duration, retries: u32) -> bool {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            match self.attempt(device, limit).await {
                Ok(()) => return true,
                Err(err) => {
                    debug!(device = %device, attempt, attempts, error = %err, "modbus probe failed")
                }
            }
        }
        false
    }
}
