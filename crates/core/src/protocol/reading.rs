//! Decoded measurement model shared by every codec

use crate::constants::ranges;
use crate::hrv::HrvSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies which decoder produced a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolTag {
    /// Fixed five-byte status/measurement frames
    FiveByte,
    /// Checksum-framed command/response protocol
    Framed,
    /// Bluetooth SIG Heart Rate Measurement characteristic
    HeartRateService,
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolTag::FiveByte => "five-byte",
            ProtocolTag::Framed => "framed",
            ProtocolTag::HeartRateService => "heart-rate",
        };
        f.write_str(name)
    }
}

/// Protocol-dependent status bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadingFlags {
    pub probe_unplugged: bool,
    pub pulse_searching: bool,
    pub motion_detected: bool,
    pub low_perfusion: bool,
}

/// A validated measurement.
///
/// Every optional field is either an in-range value or `None`; wire sentinels
/// never survive decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub protocol: ProtocolTag,
    pub spo2: Option<u8>,
    pub pulse_rate: Option<u16>,
    pub perfusion_index: Option<f32>,
    pub signal_strength: Option<u8>,
    pub finger_detected: Option<bool>,
    pub flags: ReadingFlags,
    pub pleth: Option<u8>,
    pub battery: Option<u8>,
    pub steps: Option<u32>,
    /// Inter-beat intervals carried by this frame (ms)
    pub rr_intervals: Vec<f64>,
    pub hrv: Option<HrvSnapshot>,
}

impl Reading {
    pub fn new(protocol: ProtocolTag) -> Self {
        Self::at(protocol, Utc::now())
    }

    pub fn at(protocol: ProtocolTag, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            protocol,
            spo2: None,
            pulse_rate: None,
            perfusion_index: None,
            signal_strength: None,
            finger_detected: None,
            flags: ReadingFlags::default(),
            pleth: None,
            battery: None,
            steps: None,
            rr_intervals: Vec::new(),
            hrv: None,
        }
    }

    /// True when at least one vital sign survived validation
    pub fn has_vitals(&self) -> bool {
        self.spo2.is_some() || self.pulse_rate.is_some()
    }
}

/// Oxygen saturation inside the accepted range, else absent
pub fn valid_spo2(raw: u8) -> Option<u8> {
    (ranges::SPO2_MIN..=ranges::SPO2_MAX)
        .contains(&raw)
        .then_some(raw)
}

/// Pulse rate inside the accepted range, else absent
pub fn valid_pulse(raw: u16) -> Option<u16> {
    (ranges::PULSE_MIN..=ranges::PULSE_MAX)
        .contains(&raw)
        .then_some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert_eq!(valid_spo2(98), Some(98));
        assert_eq!(valid_spo2(35), Some(35));
        assert_eq!(valid_spo2(34), None);
        assert_eq!(valid_spo2(127), None);

        assert_eq!(valid_pulse(25), Some(25));
        assert_eq!(valid_pulse(250), Some(250));
        assert_eq!(valid_pulse(24), None);
        assert_eq!(valid_pulse(255), None);
    }

    #[test]
    fn test_empty_reading_has_no_vitals() {
        let mut reading = Reading::new(ProtocolTag::FiveByte);
        assert!(!reading.has_vitals());
        reading.pulse_rate = Some(70);
        assert!(reading.has_vitals());
    }
}
