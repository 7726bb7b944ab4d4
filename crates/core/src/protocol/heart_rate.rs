//! Bluetooth SIG Heart Rate Measurement (0x2A37)

use super::reading::{valid_pulse, ProtocolTag, Reading};
use chrono::{DateTime, Utc};
use tracing::debug;

pub mod flags {
    /// Heart rate is a u16 instead of a u8
    pub const HR_FORMAT_U16: u8 = 0x01;
    /// Sensor contact detected
    pub const CONTACT_DETECTED: u8 = 0x02;
    /// Sensor contact feature supported
    pub const CONTACT_SUPPORTED: u8 = 0x04;
    /// Energy expended field present
    pub const ENERGY_EXPENDED: u8 = 0x08;
    /// One or more RR intervals follow
    pub const RR_PRESENT: u8 = 0x10;
}

/// RR intervals are transmitted in 1/1024 s
const RR_RESOLUTION: f64 = 1024.0;

pub fn decode_measurement(data: &[u8]) -> Option<Reading> {
    decode_measurement_at(data, Utc::now())
}

pub fn decode_measurement_at(data: &[u8], timestamp: DateTime<Utc>) -> Option<Reading> {
    let (&flag_byte, rest) = data.split_first()?;
    let mut cursor = rest;

    let heart_rate = if flag_byte & flags::HR_FORMAT_U16 != 0 {
        let (bytes, tail) = split(cursor, 2)?;
        cursor = tail;
        u16::from_le_bytes([bytes[0], bytes[1]])
    } else {
        let (bytes, tail) = split(cursor, 1)?;
        cursor = tail;
        u16::from(bytes[0])
    };

    if flag_byte & flags::ENERGY_EXPENDED != 0 {
        let (_, tail) = split(cursor, 2)?;
        cursor = tail;
    }

    let mut reading = Reading::at(ProtocolTag::HeartRateService, timestamp);
    reading.pulse_rate = valid_pulse(heart_rate);
    if flag_byte & flags::CONTACT_SUPPORTED != 0 {
        reading.finger_detected = Some(flag_byte & flags::CONTACT_DETECTED != 0);
    }

    if flag_byte & flags::RR_PRESENT != 0 {
        reading.rr_intervals = cursor
            .chunks_exact(2)
            .map(|pair| f64::from(u16::from_le_bytes([pair[0], pair[1]])) * 1000.0 / RR_RESOLUTION)
            .collect();
    }

    debug!(
        "Heart rate measurement {} -> hr={:?} rr={:?}",
        hex::encode(data),
        reading.pulse_rate,
        reading.rr_intervals
    );
    Some(reading)
}

fn split(data: &[u8], len: usize) -> Option<(&[u8], &[u8])> {
    (data.len() >= len).then(|| data.split_at(len))
}
