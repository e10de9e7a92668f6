//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error types for the poller, platform client and forwarder."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use r_gw_persistence::PersistenceError;
use thiserror::Error;

/// Fatal poller failures. Device I/O errors never surface here.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("reading log unavailable: {0}")]
    Log(#[from] PersistenceError),
}

/// Failures talking to the ingestion platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid platform url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("unexpected response from {endpoint}: {reason}")]
    Payload { endpoint: String, reason: String },
}

/// Fatal forwarder failures: log, cursor or credential cache storage.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("forwarder storage failure: {0}")]
    Storage(#[from] PersistenceError),
}
