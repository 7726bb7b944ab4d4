// ==============================================================================
// Framed command/response oximeter protocol
// ==============================================================================

//! Commands are checksum-trailed packets:
//!
//! ```text
//! 0xAA | cmd | !cmd | seq (u16 LE) | len (u16 LE) | payload | crc8
//! ```
//!
//! Responses share the layout with a 0x55 header. They come in several
//! shapes (device-info JSON, ping ack, generic ack that may embed a real-time
//! record, real-time record), and older firmware skips the framing entirely
//! and emits either fixed 8-byte frames or the same frames one byte per
//! notification. Decoding runs a fixed chain of strategies and stops at the
//! first one that recognises the input.

use super::crc::crc8;
use super::reading::{valid_pulse, valid_spo2, ProtocolTag, Reading};
use crate::constants::timing;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ============================================================================
// PROTOCOL CONSTANTS
// ============================================================================

pub const REQUEST_HEADER: u8 = 0xAA;
pub const RESPONSE_HEADER: u8 = 0x55;
/// header + cmd + !cmd + seq(2) + len(2)
pub const HEADER_LEN: usize = 7;
pub const CHECKSUM_LEN: usize = 1;
/// Payload size of a real-time measurement record
pub const REALTIME_PAYLOAD_LEN: usize = 12;
pub const LEGACY_FRAME_LEN: usize = 8;
/// Split responses longer than this are not reassembled
pub const MAX_RESPONSE_LEN: usize = 1024;

pub mod codes {
    pub const DEVICE_INFO: u8 = 0x14;
    pub const PING: u8 = 0x15;
    pub const REALTIME: u8 = 0x17;
    pub const ACK_SUCCESS: u8 = 0x00;
    pub const ACK_FAILURE: u8 = 0x01;
}

/// Legacy 8-byte status flags
mod legacy_status {
    pub const FINGER_OUT: u8 = 0x10;
    pub const PULSE_SEARCH: u8 = 0x20;
    pub const LOW_PERFUSION: u8 = 0x40;
    /// Never set on a frame boundary
    pub const RESERVED: u8 = 0x80;
}

/// Plausibility ranges for the last-resort offset scan
const HEURISTIC_SPO2: std::ops::RangeInclusive<u8> = 70..=100;
const HEURISTIC_PULSE: std::ops::RangeInclusive<u8> = 30..=220;
const HEURISTIC_OFFSETS: [(usize, usize); 6] = [(4, 5), (0, 1), (1, 2), (2, 3), (3, 4), (5, 6)];

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramedCommand {
    DeviceInfo,
    Ping,
    RealTime,
}

impl FramedCommand {
    pub fn code(&self) -> u8 {
        match self {
            FramedCommand::DeviceInfo => codes::DEVICE_INFO,
            FramedCommand::Ping => codes::PING,
            FramedCommand::RealTime => codes::REALTIME,
        }
    }

    pub fn try_from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "info" | "device-info" => Some(FramedCommand::DeviceInfo),
            "ping" => Some(FramedCommand::Ping),
            "realtime" | "real-time" => Some(FramedCommand::RealTime),
            _ => None,
        }
    }
}

/// One outgoing packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub command: u8,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(command: u8, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            command,
            sequence,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        buf.put_u8(REQUEST_HEADER);
        buf.put_u8(self.command);
        buf.put_u8(!self.command);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        let checksum = crc8(&buf);
        buf.put_u8(checksum);
        buf.to_vec()
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

/// Device description carried by the device-info response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    #[serde(rename = "Model", deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(rename = "SN", deserialize_with = "lenient_string")]
    pub serial_number: Option<String>,
    #[serde(rename = "HardwareVer", deserialize_with = "lenient_string")]
    pub hardware_version: Option<String>,
    #[serde(rename = "SoftwareVer", deserialize_with = "lenient_string")]
    pub software_version: Option<String>,
    #[serde(rename = "BootloaderVer", deserialize_with = "lenient_string")]
    pub bootloader_version: Option<String>,
    #[serde(rename = "Region", deserialize_with = "lenient_string")]
    pub region: Option<String>,
    #[serde(rename = "CurTIME", deserialize_with = "lenient_string")]
    pub current_time: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Firmware is inconsistent about quoting numbers
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    Truncated,
    Checksum,
    InvalidJson,
}

/// Every shape a notification on the framed characteristic can take
#[derive(Debug, Clone, PartialEq)]
pub enum FramedResponse {
    DeviceInfo(DeviceInfo),
    PingAck,
    Ack { success: bool },
    RealTime(Reading),
    Legacy(Reading),
    Heuristic(Reading),
    /// Bytes held until a streamed frame or split response completes
    Buffering,
    Malformed(Malformed),
    Unrecognized,
}

impl FramedResponse {
    /// The measurement carried by this response, if any
    pub fn into_reading(self) -> Option<Reading> {
        match self {
            FramedResponse::RealTime(reading)
            | FramedResponse::Legacy(reading)
            | FramedResponse::Heuristic(reading) => Some(reading),
            _ => None,
        }
    }

    /// True for responses that came through the 0x55 framing
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            FramedResponse::DeviceInfo(_)
                | FramedResponse::PingAck
                | FramedResponse::Ack { .. }
                | FramedResponse::RealTime(_)
        )
    }
}

/// Decode strategies in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Structured,
    SingleByteStream,
    Legacy,
    Heuristic,
}

const STRATEGIES: [Strategy; 4] = [
    Strategy::Structured,
    Strategy::SingleByteStream,
    Strategy::Legacy,
    Strategy::Heuristic,
];

// ============================================================================
// CODEC
// ============================================================================

/// Per-connection codec state: the command sequence counter and the
/// single-byte accumulator
#[derive(Debug)]
pub struct FramedCodec {
    sequence: u16,
    verify_checksum: bool,
    stream: StreamAccumulator,
    pending: Option<PendingResponse>,
}

/// Head of a structured response whose payload spans several notifications
#[derive(Debug)]
struct PendingResponse {
    bytes: Vec<u8>,
    expected: usize,
    started: Instant,
}

impl Default for FramedCodec {
    fn default() -> Self {
        Self::new(true, timing::STREAM_BUFFER_WINDOW)
    }
}

impl FramedCodec {
    pub fn new(verify_checksum: bool, stream_window: Duration) -> Self {
        Self {
            sequence: 0,
            verify_checksum,
            stream: StreamAccumulator::new(stream_window),
            pending: None,
        }
    }

    /// Sequence number the next command will carry
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Encode `command` with an empty payload and advance the sequence
    pub fn encode_command(&mut self, command: FramedCommand) -> Vec<u8> {
        self.encode_with_payload(command.code(), Vec::new())
    }

    pub fn encode_with_payload(&mut self, command: u8, payload: Vec<u8>) -> Vec<u8> {
        let packet = CommandPacket::new(command, self.sequence, payload);
        self.sequence = self.sequence.wrapping_add(1);
        packet.encode()
    }

    /// Drop buffered bytes and restart the sequence at zero
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.stream.clear();
        self.pending = None;
    }

    pub fn buffered_len(&self) -> usize {
        self.stream.buffer.len()
    }

    pub fn decode(&mut self, data: &[u8]) -> FramedResponse {
        self.decode_at(data, Instant::now(), Utc::now())
    }

    /// Decode with an explicit monotonic clock (for the accumulator window)
    /// and wall-clock timestamp (for the reading)
    pub fn decode_at(&mut self, data: &[u8], now: Instant, timestamp: DateTime<Utc>) -> FramedResponse {
        if data.is_empty() {
            return FramedResponse::Malformed(Malformed::Truncated);
        }

        if let Some(response) = self.continue_pending(data, now, timestamp) {
            return response;
        }

        for strategy in STRATEGIES {
            let attempt = match strategy {
                Strategy::Structured => self.decode_structured(data, now, timestamp),
                Strategy::SingleByteStream => (data.len() == 1)
                    .then(|| self.stream.push(data[0], now, timestamp)),
                Strategy::Legacy => decode_legacy(data, timestamp).map(FramedResponse::Legacy),
                Strategy::Heuristic => decode_heuristic(data, timestamp).map(FramedResponse::Heuristic),
            };
            if let Some(response) = attempt {
                debug!("Framed {} decoded via {:?}", hex::encode(data), strategy);
                return response;
            }
        }

        debug!("Discarding unrecognised framed notification {}", hex::encode(data));
        FramedResponse::Unrecognized
    }

    /// Append a continuation chunk to a split response. `None` means no
    /// response is pending and the input is decoded on its own.
    fn continue_pending(
        &mut self,
        data: &[u8],
        now: Instant,
        timestamp: DateTime<Utc>,
    ) -> Option<FramedResponse> {
        let pending = self.pending.as_mut()?;
        if now.saturating_duration_since(pending.started) > self.stream.window {
            debug!(
                "Discarding partial framed response ({} of {} bytes)",
                pending.bytes.len(),
                pending.expected
            );
            self.pending = None;
            return None;
        }
        if starts_response(data) {
            debug!("Partial framed response superseded by a new response");
            self.pending = None;
            return None;
        }

        pending.bytes.extend_from_slice(data);
        if pending.bytes.len() < pending.expected {
            return Some(FramedResponse::Buffering);
        }
        let complete = self.pending.take()?;
        Some(
            self.decode_structured(&complete.bytes, now, timestamp)
                .unwrap_or(FramedResponse::Unrecognized),
        )
    }

    /// Returns `None` when the input does not carry the response framing at
    /// all, so the fallbacks get a chance
    fn decode_structured(
        &mut self,
        data: &[u8],
        now: Instant,
        timestamp: DateTime<Utc>,
    ) -> Option<FramedResponse> {
        if data.len() < HEADER_LEN + CHECKSUM_LEN || !starts_response(data) {
            return None;
        }
        let command = data[1];

        let payload_len = u16::from_le_bytes([data[5], data[6]]) as usize;
        let total = HEADER_LEN + payload_len + CHECKSUM_LEN;
        if data.len() < total {
            if total > MAX_RESPONSE_LEN {
                debug!("Framed response claims {} bytes, discarding", total);
                return Some(FramedResponse::Malformed(Malformed::Truncated));
            }
            debug!("Framed response split: {} of {} bytes so far", data.len(), total);
            self.pending = Some(PendingResponse {
                bytes: data.to_vec(),
                expected: total,
                started: now,
            });
            return Some(FramedResponse::Buffering);
        }

        if self.verify_checksum {
            let expected = crc8(&data[..total - 1]);
            if expected != data[total - 1] {
                debug!(
                    "Framed response checksum mismatch: got {:02x}, expected {:02x}",
                    data[total - 1],
                    expected
                );
                return Some(FramedResponse::Malformed(Malformed::Checksum));
            }
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
        let response = match command {
            codes::DEVICE_INFO => parse_device_info(payload),
            codes::PING => FramedResponse::PingAck,
            codes::REALTIME => parse_realtime(payload, timestamp),
            codes::ACK_SUCCESS | codes::ACK_FAILURE => {
                if payload_len >= REALTIME_PAYLOAD_LEN {
                    parse_realtime(payload, timestamp)
                } else {
                    FramedResponse::Ack {
                        success: command == codes::ACK_SUCCESS,
                    }
                }
            }
            other => {
                debug!("Framed response with unknown command 0x{:02x}", other);
                FramedResponse::Unrecognized
            }
        };
        Some(response)
    }
}

/// Response header followed by a command byte and its complement
fn starts_response(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == RESPONSE_HEADER && data[2] == !data[1]
}

fn parse_device_info(payload: &[u8]) -> FramedResponse {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |idx| idx + 1);
    match serde_json::from_slice::<DeviceInfo>(&payload[..end]) {
        Ok(info) => FramedResponse::DeviceInfo(info),
        Err(e) => {
            warn!("Device info payload is not valid JSON: {}", e);
            FramedResponse::Malformed(Malformed::InvalidJson)
        }
    }
}

/// Real-time record: spo2, pulse (u16 LE), steps (u32 LE), battery, charge
/// state, motion, perfusion index (tenths), wear status
fn parse_realtime(payload: &[u8], timestamp: DateTime<Utc>) -> FramedResponse {
    if payload.len() < REALTIME_PAYLOAD_LEN {
        return FramedResponse::Malformed(Malformed::Truncated);
    }

    let spo2 = payload[0];
    let pulse = u16::from_le_bytes([payload[1], payload[2]]);
    let steps = u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]);
    let battery = payload[7];
    let charge_state = payload[8];
    let motion = payload[9];
    let perfusion = payload[10];
    let worn = payload[11] & 0x01 != 0;

    let mut reading = Reading::at(ProtocolTag::Framed, timestamp);
    reading.finger_detected = Some(worn);
    reading.steps = Some(steps);
    reading.battery = (battery <= 100).then_some(battery);
    reading.flags.motion_detected = motion > 0;

    if worn {
        reading.spo2 = valid_spo2(spo2);
        reading.pulse_rate = valid_pulse(pulse);
        reading.perfusion_index = (perfusion > 0).then(|| f32::from(perfusion) / 10.0);
    }

    debug!(
        "Real-time record: worn={} spo2={:?} pulse={:?} battery={} charge={}",
        worn, reading.spo2, reading.pulse_rate, battery, charge_state
    );
    FramedResponse::RealTime(reading)
}

/// Legacy frame: status, pleth, bargraph, perfusion index, spo2, pulse,
/// two reserved bytes. Out-of-range vitals are reported absent, as is
/// everything pulse-derived while the finger is out.
pub fn decode_legacy(frame: &[u8], timestamp: DateTime<Utc>) -> Option<Reading> {
    if frame.len() != LEGACY_FRAME_LEN {
        return None;
    }
    let status = frame[0];
    let finger_in = status & legacy_status::FINGER_OUT == 0;

    let mut reading = Reading::at(ProtocolTag::Framed, timestamp);
    reading.signal_strength = Some(frame[2] & 0x0F);
    reading.finger_detected = Some(finger_in);
    reading.flags.pulse_searching = status & legacy_status::PULSE_SEARCH != 0;
    reading.flags.low_perfusion = status & legacy_status::LOW_PERFUSION != 0;
    if finger_in {
        reading.spo2 = valid_spo2(frame[4]);
        reading.pulse_rate = valid_pulse(u16::from(frame[5]));
        reading.pleth = (frame[1] & 0x7F != 0).then_some(frame[1] & 0x7F);
        reading.perfusion_index = (frame[3] > 0).then(|| f32::from(frame[3]) / 10.0);
    }
    Some(reading)
}

/// Whether a streamed window starts on a frame boundary: no reserved status
/// bit, and vitals either in range or explained by the status flags
fn legacy_aligned(frame: &[u8]) -> bool {
    let status = frame[0];
    if status & legacy_status::RESERVED != 0 {
        return false;
    }
    let vitals = valid_spo2(frame[4]).is_some() && valid_pulse(u16::from(frame[5])).is_some();
    vitals || status & (legacy_status::FINGER_OUT | legacy_status::PULSE_SEARCH) != 0
}

/// Scan known offset pairs for a plausible (spo2, pulse) pair. Printable
/// text (a stray JSON chunk) is never taken for a measurement.
pub fn decode_heuristic(data: &[u8], timestamp: DateTime<Utc>) -> Option<Reading> {
    if data.iter().all(|b| (0x20..=0x7E).contains(b)) {
        return None;
    }
    let (spo2, pulse) = HEURISTIC_OFFSETS
        .iter()
        .filter(|(s, p)| *s < data.len() && *p < data.len())
        .map(|&(s, p)| (data[s], data[p]))
        .find(|(spo2, pulse)| HEURISTIC_SPO2.contains(spo2) && HEURISTIC_PULSE.contains(pulse))?;

    debug!("Heuristic match in {}: spo2={} pulse={}", hex::encode(data), spo2, pulse);
    let mut reading = Reading::at(ProtocolTag::Framed, timestamp);
    reading.spo2 = Some(spo2);
    reading.pulse_rate = Some(u16::from(pulse));
    Some(reading)
}

// ============================================================================
// SINGLE-BYTE STREAMING
// ============================================================================

#[derive(Debug)]
struct StreamAccumulator {
    buffer: Vec<u8>,
    started: Option<Instant>,
    window: Duration,
}

impl StreamAccumulator {
    fn new(window: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(LEGACY_FRAME_LEN * 2),
            started: None,
            window,
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.started = None;
    }

    fn push(&mut self, byte: u8, now: Instant, timestamp: DateTime<Utc>) -> FramedResponse {
        if let Some(started) = self.started {
            if now.saturating_duration_since(started) > self.window {
                debug!("Discarding {} stale streamed bytes", self.buffer.len());
                self.clear();
            }
        }
        if self.buffer.is_empty() {
            self.started = Some(now);
        }
        self.buffer.push(byte);

        while self.buffer.len() >= LEGACY_FRAME_LEN {
            let frame = &self.buffer[..LEGACY_FRAME_LEN];
            let decoded = if legacy_aligned(frame) {
                decode_legacy(frame, timestamp)
            } else {
                None
            };
            if let Some(reading) = decoded {
                self.buffer.drain(..LEGACY_FRAME_LEN);
                self.started = None;
                return FramedResponse::Legacy(reading);
            }
            // Not aligned on a frame boundary yet
            self.buffer.remove(0);
        }
        FramedResponse::Buffering
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn response(command: u8, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![RESPONSE_HEADER, command, !command];
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        data.extend_from_slice(payload);
        data.push(crc8(&data));
        data
    }

    fn realtime_payload(spo2: u8, pulse: u16, worn: bool) -> Vec<u8> {
        let mut payload = vec![spo2];
        payload.extend_from_slice(&pulse.to_le_bytes());
        payload.extend_from_slice(&1234u32.to_le_bytes());
        payload.extend_from_slice(&[87, 0, 3, 25, if worn { 0x01 } else { 0x00 }]);
        payload
    }

    const LEGACY: [u8; 8] = [0x00, 0x30, 0x05, 0x1E, 97, 72, 0x00, 0x00];

    #[test]
    fn test_command_packet_layout() {
        let mut codec = FramedCodec::default();
        let packet = codec.encode_command(FramedCommand::DeviceInfo);

        assert_eq!(&packet[..7], &[0xAA, 0x14, 0xEB, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(packet.len(), 8);
        assert_eq!(crc8(&packet[..packet.len() - 1]), packet[packet.len() - 1]);
    }

    #[test]
    fn test_sequence_increments_per_command() {
        let mut codec = FramedCodec::default();
        codec.encode_command(FramedCommand::DeviceInfo);
        codec.encode_command(FramedCommand::Ping);
        let packet = codec.encode_command(FramedCommand::RealTime);
        assert_eq!(u16::from_le_bytes([packet[3], packet[4]]), 2);
        assert_eq!(codec.sequence(), 3);

        codec.reset();
        assert_eq!(codec.sequence(), 0);
    }

    #[test]
    fn test_payload_and_checksum_roundtrip() {
        let mut codec = FramedCodec::default();
        let packet = codec.encode_with_payload(0x20, vec![0x01, 0x02, 0x03]);
        assert_eq!(u16::from_le_bytes([packet[5], packet[6]]), 3);
        assert_eq!(&packet[7..10], &[0x01, 0x02, 0x03]);
        assert_eq!(crc8(&packet[..packet.len() - 1]), *packet.last().unwrap());
    }

    #[test]
    fn test_realtime_response_worn() {
        let mut codec = FramedCodec::default();
        let data = response(codes::REALTIME, 4, &realtime_payload(96, 64, true));
        let response = codec.decode_at(&data, Instant::now(), ts());
        assert!(response.is_structured());
        let reading = response.into_reading().unwrap();

        assert_eq!(reading.spo2, Some(96));
        assert_eq!(reading.pulse_rate, Some(64));
        assert_eq!(reading.steps, Some(1234));
        assert_eq!(reading.battery, Some(87));
        assert_eq!(reading.perfusion_index, Some(2.5));
        assert_eq!(reading.finger_detected, Some(true));
        assert!(reading.flags.motion_detected);
        assert_eq!(reading.protocol, ProtocolTag::Framed);
    }

    #[test]
    fn test_realtime_not_worn_reports_absent_vitals() {
        let mut codec = FramedCodec::default();
        let data = response(codes::REALTIME, 0, &realtime_payload(96, 64, false));
        let reading = codec.decode_at(&data, Instant::now(), ts()).into_reading().unwrap();
        assert_eq!(reading.spo2, None);
        assert_eq!(reading.pulse_rate, None);
        assert_eq!(reading.perfusion_index, None);
        assert_eq!(reading.finger_detected, Some(false));
    }

    #[test]
    fn test_ack_embedding_realtime_is_redispatched() {
        let mut codec = FramedCodec::default();
        let data = response(codes::ACK_SUCCESS, 9, &realtime_payload(99, 58, true));
        match codec.decode_at(&data, Instant::now(), ts()) {
            FramedResponse::RealTime(reading) => {
                assert_eq!(reading.spo2, Some(99));
                assert_eq!(reading.pulse_rate, Some(58));
            }
            other => panic!("Expected RealTime, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_acks_and_ping() {
        let mut codec = FramedCodec::default();
        let ok = response(codes::ACK_SUCCESS, 1, &[]);
        assert_eq!(
            codec.decode_at(&ok, Instant::now(), ts()),
            FramedResponse::Ack { success: true }
        );
        let failed = response(codes::ACK_FAILURE, 1, &[0x02]);
        assert_eq!(
            codec.decode_at(&failed, Instant::now(), ts()),
            FramedResponse::Ack { success: false }
        );
        let ping = response(codes::PING, 2, &[]);
        assert_eq!(codec.decode_at(&ping, Instant::now(), ts()), FramedResponse::PingAck);
    }

    #[test]
    fn test_device_info_json() {
        let mut codec = FramedCodec::default();
        let json = br#"{"Model":"1652","SN":"2149C0012","HardwareVer":"AA","SoftwareVer":"4.6.2","CurBAT":"87%","FileVer":3}"#;
        let mut payload = json.to_vec();
        payload.extend_from_slice(&[0, 0]);
        let data = response(codes::DEVICE_INFO, 0, &payload);

        match codec.decode_at(&data, Instant::now(), ts()) {
            FramedResponse::DeviceInfo(info) => {
                assert_eq!(info.model.as_deref(), Some("1652"));
                assert_eq!(info.serial_number.as_deref(), Some("2149C0012"));
                assert_eq!(info.software_version.as_deref(), Some("4.6.2"));
                assert_eq!(info.bootloader_version, None);
                assert_eq!(info.extra.get("CurBAT"), Some(&serde_json::json!("87%")));
            }
            other => panic!("Expected DeviceInfo, got {:?}", other),
        }
    }

    #[test]
    fn test_device_info_invalid_json() {
        let mut codec = FramedCodec::default();
        let data = response(codes::DEVICE_INFO, 0, b"{not json");
        assert_eq!(
            codec.decode_at(&data, Instant::now(), ts()),
            FramedResponse::Malformed(Malformed::InvalidJson)
        );
    }

    #[test]
    fn test_checksum_mismatch_is_discarded() {
        let mut data = response(codes::REALTIME, 0, &realtime_payload(96, 64, true));
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let mut strict = FramedCodec::default();
        assert_eq!(
            strict.decode_at(&data, Instant::now(), ts()),
            FramedResponse::Malformed(Malformed::Checksum)
        );

        let mut lenient = FramedCodec::new(false, timing::STREAM_BUFFER_WINDOW);
        let reading = lenient.decode_at(&data, Instant::now(), ts()).into_reading().unwrap();
        assert_eq!(reading.spo2, Some(96));
    }

    #[test]
    fn test_split_response_is_reassembled() {
        let mut codec = FramedCodec::default();
        let data = response(codes::REALTIME, 0, &realtime_payload(96, 64, true));
        let start = Instant::now();
        assert_eq!(codec.decode_at(&data[..10], start, ts()), FramedResponse::Buffering);

        let reading = codec
            .decode_at(&data[10..], start + Duration::from_millis(30), ts())
            .into_reading()
            .unwrap();
        assert_eq!(reading.spo2, Some(96));
        assert_eq!(reading.pulse_rate, Some(64));
    }

    #[test]
    fn test_split_device_info_never_yields_vitals() {
        let mut codec = FramedCodec::default();
        let json = br#"{"Model":"1652","SN":"2149C0012","SoftwareVer":"4.6.2"}"#;
        let data = response(codes::DEVICE_INFO, 0, json);
        let start = Instant::now();

        let mut responses = Vec::new();
        for (i, chunk) in data.chunks(20).enumerate() {
            responses.push(codec.decode_at(chunk, start + Duration::from_millis(i as u64 * 20), ts()));
        }
        let (last, partial) = responses.split_last().unwrap();
        assert!(partial.iter().all(|r| *r == FramedResponse::Buffering));
        match last {
            FramedResponse::DeviceInfo(info) => assert_eq!(info.serial_number.as_deref(), Some("2149C0012")),
            other => panic!("Expected DeviceInfo, got {:?}", other),
        }

        // A continuation chunk on its own is text, not a measurement
        let orphan = codec.decode_at(&data[20..40], start + Duration::from_secs(1), ts());
        assert!(orphan.into_reading().is_none());
    }

    #[test]
    fn test_stale_split_response_is_dropped() {
        let mut codec = FramedCodec::default();
        let data = response(codes::REALTIME, 0, &realtime_payload(96, 64, true));
        let start = Instant::now();
        assert_eq!(codec.decode_at(&data[..10], start, ts()), FramedResponse::Buffering);

        let late = codec.decode_at(&data[10..], start + Duration::from_secs(6), ts());
        assert!(late.into_reading().is_none());
    }

    #[test]
    fn test_unknown_structured_command() {
        let mut codec = FramedCodec::default();
        let data = response(0x42, 0, &[97, 72]);
        assert_eq!(codec.decode_at(&data, Instant::now(), ts()), FramedResponse::Unrecognized);
    }

    #[test]
    fn test_legacy_frame() {
        let mut codec = FramedCodec::default();
        match codec.decode_at(&LEGACY, Instant::now(), ts()) {
            FramedResponse::Legacy(reading) => {
                assert_eq!(reading.spo2, Some(97));
                assert_eq!(reading.pulse_rate, Some(72));
                assert_eq!(reading.pleth, Some(0x30));
                assert_eq!(reading.signal_strength, Some(5));
                assert_eq!(reading.perfusion_index, Some(3.0));
                assert_eq!(reading.finger_detected, Some(true));
            }
            other => panic!("Expected Legacy, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_sentinels_are_absent() {
        let mut codec = FramedCodec::default();
        let finger_out = [0x10, 90, 75, 0, 0x7F, 0xFF, 0, 0];
        match codec.decode_at(&finger_out, Instant::now(), ts()) {
            FramedResponse::Legacy(reading) => {
                assert_eq!(reading.spo2, None);
                assert_eq!(reading.pulse_rate, None);
                assert_eq!(reading.pleth, None);
                assert_eq!(reading.finger_detected, Some(false));
                assert!(!reading.has_vitals());
            }
            other => panic!("Expected Legacy, got {:?}", other),
        }

        let searching = [0x20, 0x30, 0x05, 0x1E, 0x7F, 72, 0, 0];
        match codec.decode_at(&searching, Instant::now(), ts()) {
            FramedResponse::Legacy(reading) => {
                assert_eq!(reading.spo2, None);
                assert_eq!(reading.pulse_rate, Some(72));
                assert!(reading.flags.pulse_searching);
            }
            other => panic!("Expected Legacy, got {:?}", other),
        }
    }

    #[test]
    fn test_streamed_finger_out_frame() {
        let mut codec = FramedCodec::default();
        let start = Instant::now();
        let mut last = FramedResponse::Buffering;
        for byte in [0x10u8, 0x00, 0x00, 0x00, 0x7F, 0xFF, 0x00, 0x00] {
            last = codec.decode_at(&[byte], start, ts());
        }
        match last {
            FramedResponse::Legacy(reading) => {
                assert_eq!(reading.finger_detected, Some(false));
                assert!(!reading.has_vitals());
            }
            other => panic!("Expected Legacy, got {:?}", other),
        }
    }

    #[test]
    fn test_single_byte_streaming() {
        let mut codec = FramedCodec::default();
        let start = Instant::now();
        for (i, byte) in LEGACY.iter().enumerate().take(7) {
            let response = codec.decode_at(&[*byte], start + Duration::from_millis(i as u64 * 10), ts());
            assert_eq!(response, FramedResponse::Buffering);
        }
        let response = codec.decode_at(&[LEGACY[7]], start + Duration::from_millis(70), ts());
        let reading = response.into_reading().unwrap();
        assert_eq!(reading.spo2, Some(97));
        assert_eq!(reading.pulse_rate, Some(72));
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_streaming_resyncs_after_garbage() {
        let mut codec = FramedCodec::default();
        let start = Instant::now();
        let mut decoded = None;
        for byte in [0xFFu8, 0xFE].iter().chain(LEGACY.iter()) {
            if let Some(reading) = codec.decode_at(&[*byte], start, ts()).into_reading() {
                decoded = Some(reading);
            }
        }
        assert_eq!(decoded.unwrap().spo2, Some(97));
    }

    #[test]
    fn test_streaming_buffer_expires() {
        let mut codec = FramedCodec::default();
        let start = Instant::now();
        for byte in [0x01u8, 0x02, 0x03] {
            codec.decode_at(&[byte], start, ts());
        }
        assert_eq!(codec.buffered_len(), 3);

        codec.decode_at(&[0x04], start + Duration::from_secs(6), ts());
        assert_eq!(codec.buffered_len(), 1);
    }

    #[test]
    fn test_heuristic_fallback() {
        let mut codec = FramedCodec::default();
        let data = [0x00, 0x00, 0x00, 0x00, 97, 75];
        match codec.decode_at(&data, Instant::now(), ts()) {
            FramedResponse::Heuristic(reading) => {
                assert_eq!(reading.spo2, Some(97));
                assert_eq!(reading.pulse_rate, Some(75));
            }
            other => panic!("Expected Heuristic, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_input() {
        let mut codec = FramedCodec::default();
        assert_eq!(
            codec.decode_at(&[0x01, 0x02, 0x03], Instant::now(), ts()),
            FramedResponse::Unrecognized
        );
        assert_eq!(
            codec.decode_at(&[], Instant::now(), ts()),
            FramedResponse::Malformed(Malformed::Truncated)
        );
    }
}
