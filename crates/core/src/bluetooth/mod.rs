//! Bluetooth Low Energy plumbing: radio ownership, sensor links and
//! connection supervision

pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod supervisor;

pub use events::{BluetoothEvent, ConnectionState, EventHandlers};
pub use lifecycle::{RadioFactory, RadioLifecycle};
pub use manager::{select_protocol, LinkTransport, RadioManager, SensorLink};
pub use supervisor::{DisconnectCause, DisconnectOutcome, SessionSupervisor};
