//! Bluetooth event types and registered callbacks

use crate::device::{DeviceDescriptor, DeviceRole};
use crate::protocol::{DeviceInfo, Reading};
use serde::Serialize;
use std::fmt;

/// Events emitted by the radio layer and the session supervisor
#[derive(Debug, Clone)]
pub enum BluetoothEvent {
    /// A device matching the current scan target was classified
    DeviceFound(DeviceDescriptor),
    /// Decoded measurement from a connected sensor
    ReadingReceived {
        role: DeviceRole,
        device_id: String,
        reading: Reading,
    },
    /// Identification block returned by a framed-protocol oximeter
    DeviceInfoReceived {
        role: DeviceRole,
        device_id: String,
        info: DeviceInfo,
    },
    /// A role gained or lost its connection
    ConnectionStatusChanged {
        role: DeviceRole,
        connected: bool,
    },
    /// Unexpected disconnect during a session; the grace period is running
    RecoveryStarted { role: DeviceRole },
    /// Grace period expired without reconnection
    SessionTerminated { role: DeviceRole },
    /// Scanning state changed
    ScanningStateChanged {
        scanning: bool,
        target: Option<DeviceRole>,
    },
}

/// Per-role connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recovering => "recovering",
        };
        f.write_str(label)
    }
}

/// Callbacks registered by the session owner, invoked from the dispatch task
#[derive(Default)]
pub struct EventHandlers {
    device_found: Vec<Box<dyn Fn(&DeviceDescriptor) + Send + Sync>>,
    reading: Vec<Box<dyn Fn(DeviceRole, &Reading) + Send + Sync>>,
    device_info: Vec<Box<dyn Fn(DeviceRole, &DeviceInfo) + Send + Sync>>,
    connection_status: Vec<Box<dyn Fn(DeviceRole, bool) + Send + Sync>>,
    session_terminated: Vec<Box<dyn Fn(DeviceRole) + Send + Sync>>,
}

impl EventHandlers {
    pub fn on_device_found(&mut self, handler: impl Fn(&DeviceDescriptor) + Send + Sync + 'static) {
        self.device_found.push(Box::new(handler));
    }

    pub fn on_reading(&mut self, handler: impl Fn(DeviceRole, &Reading) + Send + Sync + 'static) {
        self.reading.push(Box::new(handler));
    }

    pub fn on_device_info(&mut self, handler: impl Fn(DeviceRole, &DeviceInfo) + Send + Sync + 'static) {
        self.device_info.push(Box::new(handler));
    }

    pub fn on_connection_status(&mut self, handler: impl Fn(DeviceRole, bool) + Send + Sync + 'static) {
        self.connection_status.push(Box::new(handler));
    }

    pub fn on_session_terminated(&mut self, handler: impl Fn(DeviceRole) + Send + Sync + 'static) {
        self.session_terminated.push(Box::new(handler));
    }

    pub fn dispatch(&self, event: &BluetoothEvent) {
        match event {
            BluetoothEvent::DeviceFound(descriptor) => {
                self.device_found.iter().for_each(|h| h(descriptor));
            }
            BluetoothEvent::ReadingReceived { role, reading, .. } => {
                self.reading.iter().for_each(|h| h(*role, reading));
            }
            BluetoothEvent::DeviceInfoReceived { role, info, .. } => {
                self.device_info.iter().for_each(|h| h(*role, info));
            }
            BluetoothEvent::ConnectionStatusChanged { role, connected } => {
                self.connection_status.iter().for_each(|h| h(*role, *connected));
            }
            BluetoothEvent::SessionTerminated { role } => {
                self.session_terminated.iter().for_each(|h| h(*role));
            }
            BluetoothEvent::RecoveryStarted { .. } | BluetoothEvent::ScanningStateChanged { .. } => {}
        }
    }
}
