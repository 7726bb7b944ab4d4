//! Five-byte oximeter protocol
//!
//! Frame layout:
//! - byte0: bits0-3 signal strength (15 = undefined), bit5 probe unplugged
//! - byte1: bits0-6 plethysmograph sample (0 = invalid)
//! - byte2: bit4 finger not detected, bit5 pulse search, bit6 pulse-rate bit7
//! - byte3: bits0-6 pulse rate bits0-6
//! - byte4: bits0-6 oxygen saturation (127 = invalid)
//!
//! Devices batch four frames into a 20-byte notification. Only the newest
//! frame of a burst is decoded; the older three are stale by the time the
//! notification arrives.

use super::reading::{valid_pulse, valid_spo2, ProtocolTag, Reading};
use chrono::{DateTime, Utc};
use tracing::debug;

pub const FRAME_LEN: usize = 5;
pub const BURST_LEN: usize = FRAME_LEN * 4;

const SIGNAL_UNDEFINED: u8 = 0x0F;
const PULSE_SENTINEL: u16 = 0xFF;
const SPO2_SENTINEL: u8 = 0x7F;

const PROBE_UNPLUGGED: u8 = 0x20;
const FINGER_OUT: u8 = 0x10;
const PULSE_SEARCH: u8 = 0x20;
const PULSE_HIGH_BIT: u8 = 0x40;

/// Decode a notification received now
pub fn decode_notification(data: &[u8]) -> Option<Reading> {
    decode_notification_at(data, Utc::now())
}

/// Decode a notification, stamping the reading with `timestamp`.
///
/// Returns `None` when fewer than five bytes arrived.
pub fn decode_notification_at(data: &[u8], timestamp: DateTime<Utc>) -> Option<Reading> {
    let frame = select_frame(data)?;
    Some(decode_frame(frame, timestamp))
}

/// Pick the frame to decode out of a notification
pub fn select_frame(data: &[u8]) -> Option<&[u8; FRAME_LEN]> {
    let frame = match data.len() {
        len if len < FRAME_LEN => {
            debug!("Five-byte notification too short ({} bytes)", len);
            return None;
        }
        BURST_LEN => &data[BURST_LEN - FRAME_LEN..],
        FRAME_LEN => data,
        len => {
            debug!("Unexpected five-byte notification length {}, using first frame", len);
            &data[..FRAME_LEN]
        }
    };
    frame.try_into().ok()
}

/// Decode one frame
pub fn decode_frame(frame: &[u8; FRAME_LEN], timestamp: DateTime<Utc>) -> Reading {
    let [b0, b1, b2, b3, b4] = *frame;
    let mut reading = Reading::at(ProtocolTag::FiveByte, timestamp);

    let signal = b0 & 0x0F;
    reading.signal_strength = (signal != SIGNAL_UNDEFINED).then_some(signal);
    reading.flags.probe_unplugged = b0 & PROBE_UNPLUGGED != 0;

    let pleth = b1 & 0x7F;
    reading.pleth = (pleth != 0).then_some(pleth);

    reading.finger_detected = Some(b2 & FINGER_OUT == 0);
    reading.flags.pulse_searching = b2 & PULSE_SEARCH != 0;

    let pulse = (u16::from(b2 & PULSE_HIGH_BIT) << 1) | u16::from(b3 & 0x7F);
    reading.pulse_rate = if pulse == PULSE_SENTINEL {
        None
    } else {
        valid_pulse(pulse)
    };

    let spo2 = b4 & 0x7F;
    reading.spo2 = if spo2 == SPO2_SENTINEL {
        None
    } else {
        valid_spo2(spo2)
    };

    debug!(
        "Five-byte frame {} -> spo2={:?} pulse={:?}",
        hex::encode(frame),
        reading.spo2,
        reading.pulse_rate
    );
    reading
}
