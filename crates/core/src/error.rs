//! Error types surfaced by radio and session operations
//!
//! Malformed frames and out-of-range measurements are not errors: the codecs
//! drop them or report the field as absent. Only operations the caller awaits
//! (scan, connect, discovery, writes) reject with a `BiosensorError`.

use crate::device::DeviceRole;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BiosensorError>;

#[derive(Debug, Error)]
pub enum BiosensorError {
    #[error("no Bluetooth adapter available")]
    RadioUnavailable,

    #[error("radio manager not acquired; call acquire_reference() first")]
    RadioNotAcquired,

    #[error("failed to start scanning: {0}")]
    ScanFailed(String),

    #[error("connection to {device} failed: {reason}")]
    ConnectionFailed { device: String, reason: String },

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("device {device} exposes no supported {what}")]
    MissingEndpoint { device: String, what: &'static str },

    #[error("device {0} has not been discovered")]
    UnknownDevice(String),

    #[error("no {0} connected")]
    NotConnected(DeviceRole),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Radio(#[from] btleplug::Error),
}

impl BiosensorError {
    pub(crate) fn connection(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}
