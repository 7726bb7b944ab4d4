//! Wire protocols spoken by the supported sensors
//!
//! Two incompatible oximeter protocols (a fixed five-byte frame and a
//! checksum-framed command/response protocol) plus the standard Heart Rate
//! Measurement characteristic. Every decoder produces a [`Reading`].

pub mod crc;
pub mod decoder;
pub mod five_byte;
pub mod framed;
pub mod heart_rate;
pub mod reading;
pub mod schedule;

pub use decoder::{Decoded, SensorDecoder};
pub use framed::{CommandPacket, DeviceInfo, FramedCodec, FramedCommand, FramedResponse};
pub use reading::{ProtocolTag, Reading, ReadingFlags};
pub use schedule::{CommandSchedule, ScheduleTiming};
