//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Checks shipped configuration files against the loader."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use r_gw_common::config::AppConfig;
use r_gw_common::LogFormat;

fn read(path: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let full = Path::new(manifest_dir).join("..").join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn example_config_matches_defaults() {
    let config: AppConfig = read("configs/gateway.example.toml").parse().unwrap();
    let defaults: AppConfig = "".parse().unwrap();

    assert_eq!(config.discovery.subnet, defaults.discovery.subnet);
    assert_eq!(config.discovery.max_in_flight, 50);
    assert_eq!(config.discovery.scan_timeout, Duration::from_millis(500));
    assert_eq!(config.poller.poll_interval, Duration::from_secs(5));
    assert_eq!(config.poller.reconnection_delay, Duration::from_secs(5));
    assert_eq!(config.poller.max_reconnection_attempts, 3);
    assert_eq!(config.poller.parameters, defaults.poller.parameters);
    assert_eq!(config.storage.log_path, defaults.storage.log_path);
    assert_eq!(config.platform.device_type, "modbus_device");
    assert_eq!(config.forwarder.debounce, Duration::from_millis(250));
    assert_eq!(config.logging.format, LogFormat::Pretty);
}

#[test]
fn example_config_declares_frontmatter() {
    let content = read("configs/gateway.example.toml");
    assert!(
        content.starts_with("# ---"),
        "example config must include frontmatter header"
    );
}

#[test]
fn parameter_order_follows_file_order() {
    let config: AppConfig = r#"
        [poller.parameters]
        power = [30033, 30034]
        current = [30031, 30032]
    "#
    .parse()
    .unwrap();
    assert_eq!(config.poller.parameter_names(), vec!["power", "current"]);
}

#[test]
fn invalid_platform_url_is_rejected() {
    let err = r#"
        [platform]
        base_url = "not a url"
    "#
    .parse::<AppConfig>()
    .unwrap_err();
    assert!(err.to_string().contains("platform.base_url"), "{err:#}");
}
