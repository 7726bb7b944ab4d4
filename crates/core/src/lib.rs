//! Pulsewire Core Library
//!
//! Discovery, protocol decoding and session supervision for Bluetooth LE
//! pulse oximeters and heart-rate monitors, with dual-timeframe HRV.

pub mod bluetooth;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod hrv;
pub mod protocol;
pub mod service;

// Re-export important types for easier access
pub use bluetooth::{BluetoothEvent, ConnectionState};
pub use config::Config;
pub use device::{Advertisement, DeviceClassifier, DeviceDescriptor, DeviceRole};
pub use error::{BiosensorError, Result};
pub use hrv::{HrvEngine, HrvResult, HrvSnapshot, Timeframe};
pub use protocol::{DeviceInfo, FramedCodec, FramedCommand, ProtocolTag, Reading, ReadingFlags};
pub use service::{BiosensorService, DisconnectTarget};
