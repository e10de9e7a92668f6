//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry forwarder: log tailing, provisioning and cursor handling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Consumer side of the reading log.
//!
//! Each batch runs from the persisted cursor to the end of committed data.
//! Records are delivered at most once: a rejected push is logged and the
//! record is still consumed. The cursor is persisted once per batch, so a
//! crash mid-batch replays that batch.

use std::sync::Arc;

use indexmap::IndexMap;
use r_gw_common::{DeviceAddress, Reading};
use r_gw_persistence::{CredentialCache, CursorStore, ReadingLogReader};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::ForwarderError;
use crate::platform::{device_name, provision_device, IngestionPlatform};
use crate::watcher::LogWatcher;

/// Body posted to the telemetry endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload {
    /// Reading timestamp in epoch milliseconds.
    pub ts: i64,
    pub values: IndexMap<String, f32>,
}

impl TelemetryPayload {
    /// Build the payload for `reading`, dropping values JSON cannot carry.
    pub fn from_reading(reading: &Reading) -> Self {
        let mut values = IndexMap::with_capacity(reading.values.len());
        for (name, value) in &reading.values {
            if value.is_finite() {
                values.insert(name.clone(), *value);
            } else {
                warn!(device = %reading.device, parameter = %name, value = %value, "non-finite value not forwarded");
            }
        }
        Self {
            ts: reading.timestamp.timestamp_millis(),
            values,
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The platform refused or could not be reached.
    Rejected { reason: String },
    /// No access token could be obtained for the device.
    Unprovisioned { reason: String },
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<(u64, DeliveryOutcome)>,
    /// Cursor after the batch.
    pub cursor: u64,
}

impl BatchReport {
    pub fn records(&self) -> usize {
        self.outcomes.len()
    }

    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == DeliveryOutcome::Delivered)
            .count()
    }
}

pub struct Forwarder {
    platform: Arc<dyn IngestionPlatform>,
    reader: ReadingLogReader,
    cursor_store: CursorStore,
    cache: CredentialCache,
    device_type: String,
    cursor: u64,
}

impl Forwarder {
    /// Build a forwarder resuming from the persisted cursor.
    pub fn new(
        platform: Arc<dyn IngestionPlatform>,
        reader: ReadingLogReader,
        cursor_store: CursorStore,
        cache: CredentialCache,
        device_type: impl Into<String>,
    ) -> Result<Self, ForwarderError> {
        let cursor = cursor_store.load()?;
        debug!(cursor, cached_devices = cache.len(), "forwarder resuming");
        Ok(Self {
            platform,
            reader,
            cursor_store,
            cache,
            device_type: device_type.into(),
            cursor,
        })
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.cache
    }

    /// Forward every record committed after the cursor.
    pub async fn process_new_data(&mut self) -> Result<BatchReport, ForwarderError> {
        let mut report = BatchReport {
            cursor: self.cursor,
            ..BatchReport::default()
        };
        for record in self.reader.read_from(self.cursor)? {
            let record = record?;
            let outcome = self.forward(&record.reading).await?;
            report.outcomes.push((record.position, outcome));
            report.cursor = record.next;
        }

        if report.cursor != self.cursor {
            self.cursor_store.persist(report.cursor)?;
            self.cursor = report.cursor;
            info!(
                records = report.records(),
                delivered = report.delivered(),
                offset = report.cursor,
                "forwarded batch"
            );
        }
        Ok(report)
    }

    async fn forward(&mut self, reading: &Reading) -> Result<DeliveryOutcome, ForwarderError> {
        let token = match self.access_token(reading.device).await? {
            Ok(token) => token,
            Err(reason) => return Ok(DeliveryOutcome::Unprovisioned { reason }),
        };

        let payload = TelemetryPayload::from_reading(reading);
        match self.platform.push_telemetry(&token, &payload).await {
            Ok(()) => {
                debug!(device = %reading.device, ts = payload.ts, "telemetry delivered");
                Ok(DeliveryOutcome::Delivered)
            }
            Err(err) => {
                warn!(device = %reading.device, ts = payload.ts, error = %err, "telemetry rejected; record consumed");
                Ok(DeliveryOutcome::Rejected {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Cached token, or a freshly provisioned one persisted to the cache.
    /// The inner error is a provisioning failure for this device only.
    async fn access_token(
        &mut self,
        device: DeviceAddress,
    ) -> Result<Result<String, String>, ForwarderError> {
        if let Some(token) = self.cache.get(&device) {
            return Ok(Ok(token.to_owned()));
        }
        let name = device_name(&self.device_type, &device);
        match provision_device(self.platform.as_ref(), &name, &self.device_type).await {
            Ok(token) => {
                self.cache.insert(device, token.clone());
                self.cache.persist()?;
                info!(device = %device, device_name = %name, "device provisioned");
                Ok(Ok(token))
            }
            Err(err) => {
                error!(device = %device, device_name = %name, error = %err, "provisioning failed; record skipped");
                Ok(Err(err.to_string()))
            }
        }
    }

    /// Process on every trigger until shutdown. Pending data is forwarded
    /// once at startup.
    pub async fn run(
        mut self,
        mut trigger: LogWatcher,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ForwarderError> {
        self.process_new_data().await?;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(cursor = self.cursor, "forwarder shutdown signal received");
                    break;
                }
                kind = trigger.next() => {
                    debug!(trigger = ?kind, "forwarder triggered");
                    self.process_new_data().await?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("log", &self.reader.path())
            .field("cursor", &self.cursor)
            .field("cached_devices", &self.cache.len())
            .finish()
    }
}
