//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use r_gw_common::DeviceAddress;
use thiserror::Error;

/// Errors raised while talking to field devices or scanning for them.
#[derive(Debug, Error)]
pub enum NetError {
    /// The transport could not be opened.
    #[error("connection to {device} failed: {source}")]
    Connect {
        /// Device that was dialled.
        device: DeviceAddress,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// A connect or read did not complete in time.
    #[error("{operation} on {device} timed out after {timeout_ms} ms")]
    Timeout {
        /// Device the operation targeted.
        device: DeviceAddress,
        /// `connect` or `read`.
        operation: &'static str,
        /// Configured bound.
        timeout_ms: u64,
    },
    /// Framing or socket failure on an open transport.
    #[error("transport failure on {device}: {message}")]
    Transport {
        /// Device the transport belongs to.
        device: DeviceAddress,
        /// Description reported by the protocol stack.
        message: String,
    },
    /// The device answered with a protocol exception.
    #[error("device {device} returned exception {code}")]
    Exception {
        /// Device that answered.
        device: DeviceAddress,
        /// Exception name as reported by the protocol stack.
        code: String,
    },
    /// The device returned fewer registers than requested.
    #[error("device {device} returned {actual} registers, expected {expected}")]
    ShortRead {
        /// Device that answered.
        device: DeviceAddress,
        /// Requested register count.
        expected: usize,
        /// Received register count.
        actual: usize,
    },
    /// The transport was used after being closed.
    #[error("transport to {0} is closed")]
    Closed(DeviceAddress),
    /// No probe is registered under the requested identifier.
    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),
    /// The CIDR string could not be parsed.
    #[error("invalid subnet '{input}': {reason}")]
    InvalidSubnet {
        /// Text that was parsed.
        input: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Scan task bookkeeping failed.
    #[error("scan execution failed: {0}")]
    Scan(#[from] anyhow::Error),
}
