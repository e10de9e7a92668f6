//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Gateway configuration schema, defaults and validation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::model::MODBUS_TCP_PORT;

fn default_subnet() -> String {
    "192.168.1.0/24".to_owned()
}

fn default_port() -> u16 {
    MODBUS_TCP_PORT
}

fn default_scan_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_probe_retries() -> u32 {
    1
}

fn default_max_in_flight() -> usize {
    50
}

fn default_protocol() -> String {
    "modbus".to_owned()
}

fn default_devices_file() -> PathBuf {
    PathBuf::from("target/state/connected_devices.json")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_register_count() -> u16 {
    56
}

fn default_register_number_base() -> u16 {
    30001
}

fn default_unit_id() -> u8 {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_reconnection_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_reconnection_attempts() -> u32 {
    3
}

fn default_parameters() -> IndexMap<String, RegisterPair> {
    let mut parameters = IndexMap::new();
    parameters.insert("current".to_owned(), RegisterPair::new(30031, 30032));
    parameters.insert("voltage".to_owned(), RegisterPair::new(30025, 30026));
    parameters.insert("temperature".to_owned(), RegisterPair::new(30027, 30028));
    parameters.insert("power".to_owned(), RegisterPair::new(30033, 30034));
    parameters
}

fn default_log_path() -> PathBuf {
    PathBuf::from("target/state/modbus_data.csv")
}

fn default_cursor_path() -> PathBuf {
    PathBuf::from("target/state/forwarder_cursor.json")
}

fn default_credential_cache_path() -> PathBuf {
    PathBuf::from("target/state/device_tokens.json")
}

fn default_base_url() -> String {
    "http://localhost:8080".to_owned()
}

fn default_username() -> String {
    "tenant@thingsboard.org".to_owned()
}

fn default_password() -> String {
    "tenant".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_device_type() -> String {
    "modbus_device".to_owned()
}

fn default_debounce() -> Duration {
    Duration::from_millis(250)
}

fn default_fallback_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the gateway runtime. Loaded once; there
/// is no hot reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_GW_CONFIG";

    /// Load configuration from disk, respecting the `R_GW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.poller.validate()?;
        self.platform.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// IPv4 subnet in CIDR notation.
    #[serde(default = "default_subnet")]
    pub subnet: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_scan_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub scan_timeout: Duration,
    #[serde(default = "default_probe_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    /// Upper bound on simultaneous connectivity checks.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Where the discovered device list is written.
    #[serde(default = "default_devices_file")]
    pub devices_file: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            port: default_port(),
            scan_timeout: default_scan_timeout(),
            probe_timeout: default_probe_timeout(),
            probe_retries: default_probe_retries(),
            max_in_flight: default_max_in_flight(),
            protocol: default_protocol(),
            devices_file: default_devices_file(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(anyhow!("discovery.max_in_flight must be greater than zero"));
        }
        if self.probe_retries == 0 {
            return Err(anyhow!("discovery.probe_retries must be at least one"));
        }
        if self.subnet.trim().is_empty() {
            return Err(anyhow!("discovery.subnet cannot be empty"));
        }
        Ok(())
    }
}

/// Reading-log column holding the reading timestamp.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
/// Reading-log column holding the device address.
pub const DEVICE_COLUMN: &str = "device_address";

/// Pair of register numbers (high word first) holding one 32-bit float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u16; 2]", into = "[u16; 2]")]
pub struct RegisterPair {
    pub high: u16,
    pub low: u16,
}

impl RegisterPair {
    pub const fn new(high: u16, low: u16) -> Self {
        Self { high, low }
    }
}

impl From<[u16; 2]> for RegisterPair {
    fn from(value: [u16; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<RegisterPair> for [u16; 2] {
    fn from(value: RegisterPair) -> Self {
        [value.high, value.low]
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    /// Protocol address of the first register in the block.
    #[serde(default)]
    pub register_start: u16,
    #[serde(default = "default_register_count")]
    pub register_count: u16,
    /// Register number that labels block index zero (e.g. 30001).
    #[serde(default = "default_register_number_base")]
    pub register_number_base: u16,
    /// Modbus unit identifier addressed on every device.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_read_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde(default = "default_reconnection_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnection_delay: Duration,
    #[serde(default = "default_max_reconnection_attempts")]
    pub max_reconnection_attempts: u32,
    /// Parameter name to register pair. Order defines log column order.
    #[serde(default = "default_parameters")]
    pub parameters: IndexMap<String, RegisterPair>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            register_start: 0,
            register_count: default_register_count(),
            register_number_base: default_register_number_base(),
            unit_id: default_unit_id(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            reconnection_delay: default_reconnection_delay(),
            max_reconnection_attempts: default_max_reconnection_attempts(),
            parameters: default_parameters(),
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.register_count == 0 {
            return Err(anyhow!("poller.register_count must be greater than zero"));
        }
        if self.max_reconnection_attempts == 0 {
            return Err(anyhow!(
                "poller.max_reconnection_attempts must be at least one"
            ));
        }
        if self.parameters.is_empty() {
            return Err(anyhow!("poller.parameters must declare at least one parameter"));
        }
        let mut seen_pairs: HashMap<RegisterPair, &str> = HashMap::new();
        for (name, pair) in &self.parameters {
            if !is_valid_column_name(name) {
                return Err(anyhow!(
                    "invalid parameter name {:?}: use non-empty text without commas, quotes or control characters",
                    name
                ));
            }
            if name == TIMESTAMP_COLUMN || name == DEVICE_COLUMN {
                return Err(anyhow!("parameter name '{}' is a reserved log column", name));
            }
            if let Some(previous) = seen_pairs.insert(*pair, name) {
                return Err(anyhow!(
                    "parameters '{}' and '{}' map to the same registers [{}, {}]",
                    previous,
                    name,
                    pair.high,
                    pair.low
                ));
            }
            if pair.high < self.register_number_base || pair.low < self.register_number_base {
                return Err(anyhow!(
                    "parameter '{}' registers [{}, {}] precede register_number_base {}",
                    name,
                    pair.high,
                    pair.low,
                    self.register_number_base
                ));
            }
        }
        Ok(())
    }

    /// Parameter names in log column order.
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }
}

fn is_valid_column_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name.trim() == name
        && !name
            .chars()
            .any(|ch| ch == ',' || ch == '"' || ch == '\'' || ch.is_control())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,
    #[serde(default = "default_credential_cache_path")]
    pub credential_cache_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            cursor_path: default_cursor_path(),
            credential_cache_path: default_credential_cache_path(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Device type assigned to provisioned devices; also the name prefix.
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: default_username(),
            password: default_password(),
            request_timeout: default_request_timeout(),
            device_type: default_device_type(),
        }
    }
}

impl PlatformConfig {
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.base_url)
            .with_context(|| format!("platform.base_url '{}' is not a valid URL", self.base_url))?;
        if self.device_type.trim().is_empty() {
            return Err(anyhow!("platform.device_type cannot be empty"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Quiet period after a file-change event before a batch is processed.
    #[serde(default = "default_debounce")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub debounce: Duration,
    /// Polling trigger used in addition to file notifications.
    #[serde(default = "default_fallback_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fallback_interval: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            fallback_interval: default_fallback_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
