//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "End-to-end poll, log and forward pipeline through the orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_gw_common::{AppConfig, DeviceAddress};
use r_gw_core::{GatewayOrchestrator, RunMode, ThingsBoardClient};
use r_gw_net::{f32_to_registers, NetError, RegisterTransport, TransportConnector};
use r_gw_persistence::{CredentialCache, CursorStore, ReadingLogReader, ReadingLogWriter};
use support::MockThingsBoard;
use tempfile::TempDir;

#[derive(Default)]
struct Counters {
    connects: u32,
    closes: u32,
}

/// Every device answers with the same meter block.
#[derive(Clone)]
struct MeterConnector {
    block: Vec<u16>,
    counters: Arc<Mutex<Counters>>,
}

impl MeterConnector {
    fn new() -> Self {
        let mut block = vec![0u16; 56];
        for (index, value) in [(24usize, 230.5f32), (26, 41.25), (30, 5.0), (32, 1152.5)] {
            let (high, low) = f32_to_registers(value);
            block[index] = high;
            block[index + 1] = low;
        }
        Self {
            block,
            counters: Arc::default(),
        }
    }
}

struct MeterTransport {
    block: Vec<u16>,
    counters: Arc<Mutex<Counters>>,
}

#[async_trait]
impl RegisterTransport for MeterTransport {
    async fn read_input_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, NetError> {
        let start = usize::from(start);
        Ok(self.block[start..start + usize::from(count)].to_vec())
    }

    async fn close(&mut self) {
        self.counters.lock().closes += 1;
    }
}

#[async_trait]
impl TransportConnector for MeterConnector {
    async fn connect(&self, _device: DeviceAddress) -> Result<Box<dyn RegisterTransport>, NetError> {
        self.counters.lock().connects += 1;
        Ok(Box::new(MeterTransport {
            block: self.block.clone(),
            counters: self.counters.clone(),
        }))
    }
}

fn gateway_config(dir: &TempDir, base_url: String) -> AppConfig {
    let mut config = AppConfig::default();
    config.poller.poll_interval = Duration::from_millis(50);
    config.storage.log_path = dir.path().join("modbus_data.csv");
    config.storage.cursor_path = dir.path().join("forwarder_cursor.json");
    config.storage.credential_cache_path = dir.path().join("device_tokens.json");
    config.platform.base_url = base_url;
    config.forwarder.debounce = Duration::from_millis(10);
    config.forwarder.fallback_interval = Duration::from_millis(50);
    config
}

fn orchestrator(config: AppConfig, connector: MeterConnector) -> GatewayOrchestrator {
    let platform = Arc::new(ThingsBoardClient::from_config(&config.platform).unwrap());
    GatewayOrchestrator::with_components(config, Arc::new(connector), platform)
}

async fn wait_for_telemetry(mock: &MockThingsBoard, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while mock.telemetry().len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} telemetry posts"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readings_flow_from_device_to_platform() {
    let dir = TempDir::new().unwrap();
    let mock = MockThingsBoard::start().await;
    let config = gateway_config(&dir, mock.base_url());
    let connector = MeterConnector::new();
    let device: DeviceAddress = "192.168.1.10".parse().unwrap();

    let handle = orchestrator(config.clone(), connector.clone())
        .start(vec![device], RunMode::Full)
        .await
        .unwrap();
    wait_for_telemetry(&mock, 3).await;
    handle.shutdown().await.unwrap();

    let counters = connector.counters.lock();
    assert_eq!(counters.connects, 1);
    assert_eq!(counters.closes, 1, "transport closed on shutdown");
    drop(counters);

    let state = mock.state.lock();
    assert_eq!(
        state.created,
        vec![("modbus_device_192_168_1_10".to_owned(), "modbus_device".to_owned())]
    );
    let (token, body) = &state.telemetry[0];
    assert_eq!(token, "token-device-1");
    assert_eq!(body["values"]["voltage"], 230.5);
    assert_eq!(body["values"]["temperature"], 41.25);
    assert_eq!(body["values"]["current"], 5.0);
    assert_eq!(body["values"]["power"], 1152.5);
    assert!(body["ts"].as_i64().unwrap() > 0);
    let delivered = state.telemetry.len();
    drop(state);

    // Everything before the cursor was posted exactly once; nothing after it was.
    let cursor = CursorStore::new(&config.storage.cursor_path).load().unwrap();
    let reader = ReadingLogReader::new(&config.storage.log_path, &config.poller.parameter_names());
    let before_cursor = reader
        .read_from(0)
        .unwrap()
        .map(Result::unwrap)
        .filter(|record| record.next <= cursor)
        .count();
    assert_eq!(before_cursor, delivered);

    let cache = CredentialCache::load(&config.storage.credential_cache_path).unwrap();
    assert_eq!(cache.get(&device), Some("token-device-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_without_reprovisioning() {
    let dir = TempDir::new().unwrap();
    let mock = MockThingsBoard::start().await;
    let config = gateway_config(&dir, mock.base_url());
    let device: DeviceAddress = "192.168.1.10".parse().unwrap();

    let handle = orchestrator(config.clone(), MeterConnector::new())
        .start(vec![device], RunMode::Full)
        .await
        .unwrap();
    wait_for_telemetry(&mock, 2).await;
    handle.shutdown().await.unwrap();
    let first_run = mock.telemetry().len();

    let handle = orchestrator(config.clone(), MeterConnector::new())
        .start(vec![device], RunMode::Full)
        .await
        .unwrap();
    wait_for_telemetry(&mock, first_run + 2).await;
    handle.shutdown().await.unwrap();

    let state = mock.state.lock();
    assert_eq!(state.created.len(), 1);
    assert_eq!(state.logins, 1, "cached credentials skip provisioning");
    let mut timestamps: Vec<i64> = state
        .telemetry
        .iter()
        .map(|(_, body)| body["ts"].as_i64().unwrap())
        .collect();
    let total = timestamps.len();
    timestamps.dedup();
    assert_eq!(timestamps.len(), total, "no reading forwarded twice");
}

#[tokio::test]
async fn forward_only_drains_existing_log() {
    let dir = TempDir::new().unwrap();
    let mock = MockThingsBoard::start().await;
    let config = gateway_config(&dir, mock.base_url());
    let params = config.poller.parameter_names();
    let device: DeviceAddress = "10.0.0.5:1502".parse().unwrap();

    let mut writer = ReadingLogWriter::open(&config.storage.log_path, &params).unwrap();
    for step in 0..3 {
        let mut values = indexmap::IndexMap::new();
        values.insert("current".to_owned(), step as f32);
        writer
            .append(&r_gw_common::Reading::new(device, values))
            .unwrap();
    }
    drop(writer);

    let handle = orchestrator(config.clone(), MeterConnector::new())
        .start(Vec::new(), RunMode::ForwardOnly)
        .await
        .unwrap();
    wait_for_telemetry(&mock, 3).await;
    handle.shutdown().await.unwrap();

    let state = mock.state.lock();
    assert_eq!(state.created[0].0, "modbus_device_10_0_0_5_1502");
    let currents: Vec<f64> = state
        .telemetry
        .iter()
        .map(|(_, body)| body["values"]["current"].as_f64().unwrap())
        .collect();
    assert_eq!(currents, vec![0.0, 1.0, 2.0]);
}

#[tokio::test]
async fn polling_without_devices_is_refused() {
    let dir = TempDir::new().unwrap();
    let config = gateway_config(&dir, "http://127.0.0.1:9".to_owned());
    let err = orchestrator(config, MeterConnector::new())
        .start(Vec::new(), RunMode::PollOnly)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no devices"), "{err:#}");
}

#[tokio::test]
async fn malformed_credential_cache_stops_startup() {
    let dir = TempDir::new().unwrap();
    let config = gateway_config(&dir, "http://127.0.0.1:9".to_owned());
    std::fs::write(&config.storage.credential_cache_path, "{ not json").unwrap();
    let err = orchestrator(config, MeterConnector::new())
        .start(Vec::new(), RunMode::ForwardOnly)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("credential cache"), "{err:#}");
}

#[tokio::test]
async fn log_with_foreign_header_stops_startup() {
    let dir = TempDir::new().unwrap();
    let config = gateway_config(&dir, "http://127.0.0.1:9".to_owned());
    ReadingLogWriter::open(&config.storage.log_path, &["frequency".to_owned()]).unwrap();
    let device: DeviceAddress = "192.168.1.10".parse().unwrap();
    let err = orchestrator(config, MeterConnector::new())
        .start(vec![device], RunMode::PollOnly)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reading log"), "{err:#}");
}
