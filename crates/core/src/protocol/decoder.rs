//! Per-connection decoding state
//!
//! One `SensorDecoder` lives inside each connection's notification loop and
//! owns everything protocol-specific for that link: the framed codec with its
//! sequence counter and streaming buffer, and the command schedule.

use super::framed::{FramedCodec, FramedCommand, FramedResponse};
use super::schedule::{CommandSchedule, ScheduleTiming};
use super::{five_byte, heart_rate, DeviceInfo, ProtocolTag, Reading};
use chrono::{DateTime, Utc};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Reading(Reading),
    DeviceInfo(DeviceInfo),
    /// Malformed, ambiguous, acknowledgement-only or still buffering
    Nothing,
}

#[derive(Debug)]
enum State {
    FiveByte,
    HeartRate,
    Framed {
        codec: FramedCodec,
        schedule: CommandSchedule,
    },
}

#[derive(Debug)]
pub struct SensorDecoder {
    state: State,
}

impl SensorDecoder {
    pub fn five_byte() -> Self {
        Self {
            state: State::FiveByte,
        }
    }

    pub fn heart_rate() -> Self {
        Self {
            state: State::HeartRate,
        }
    }

    pub fn framed(codec: FramedCodec, timing: ScheduleTiming, subscribed_at: Instant) -> Self {
        Self {
            state: State::Framed {
                codec,
                schedule: CommandSchedule::new(subscribed_at, timing),
            },
        }
    }

    pub fn protocol(&self) -> ProtocolTag {
        match self.state {
            State::FiveByte => ProtocolTag::FiveByte,
            State::HeartRate => ProtocolTag::HeartRateService,
            State::Framed { .. } => ProtocolTag::Framed,
        }
    }

    pub fn decode(&mut self, data: &[u8], now: Instant, timestamp: DateTime<Utc>) -> Decoded {
        let reading = match &mut self.state {
            State::FiveByte => five_byte::decode_notification_at(data, timestamp),
            State::HeartRate => heart_rate::decode_measurement_at(data, timestamp),
            State::Framed { codec, schedule } => {
                let response = codec.decode_at(data, now, timestamp);
                if response.is_structured() {
                    schedule.note_structured_data();
                }
                match response {
                    FramedResponse::DeviceInfo(info) => return Decoded::DeviceInfo(info),
                    other => other.into_reading(),
                }
            }
        };
        reading.map_or(Decoded::Nothing, Decoded::Reading)
    }

    /// When the next outgoing command falls due
    pub fn next_command_due(&self) -> Option<Instant> {
        match &self.state {
            State::Framed { schedule, .. } => schedule.next_due(),
            _ => None,
        }
    }

    /// Encoded command due at `now`, if any
    pub fn take_due_command(&mut self, now: Instant) -> Option<(FramedCommand, Vec<u8>)> {
        match &mut self.state {
            State::Framed { codec, schedule } => {
                let command = schedule.poll(now)?;
                Some((command, codec.encode_command(command)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::crc8;
    use crate::protocol::framed::codes;
    use std::time::Duration;

    #[test]
    fn test_five_byte_decoder() {
        let mut decoder = SensorDecoder::five_byte();
        assert_eq!(decoder.protocol(), ProtocolTag::FiveByte);
        match decoder.decode(&[0x08, 0x40, 0x00, 72, 98], Instant::now(), Utc::now()) {
            Decoded::Reading(reading) => assert_eq!(reading.spo2, Some(98)),
            other => panic!("Expected reading, got {:?}", other),
        }
        assert_eq!(decoder.decode(&[0x01], Instant::now(), Utc::now()), Decoded::Nothing);
        assert!(decoder.take_due_command(Instant::now()).is_none());
    }

    #[test]
    fn test_framed_decoder_bootstraps_commands() {
        let start = Instant::now();
        let mut decoder = SensorDecoder::framed(FramedCodec::default(), ScheduleTiming::default(), start);

        let (command, packet) = decoder
            .take_due_command(start + Duration::from_millis(1500))
            .unwrap();
        assert_eq!(command, FramedCommand::DeviceInfo);
        assert_eq!(packet[1], codes::DEVICE_INFO);

        let (command, packet) = decoder
            .take_due_command(start + Duration::from_millis(1800))
            .unwrap();
        assert_eq!(command, FramedCommand::Ping);
        assert_eq!(u16::from_le_bytes([packet[3], packet[4]]), 1);
    }

    #[test]
    fn test_framed_decoder_unsolicited_stream() {
        let start = Instant::now();
        let mut decoder = SensorDecoder::framed(FramedCodec::default(), ScheduleTiming::default(), start);

        let mut data = vec![0x55, codes::PING, !codes::PING, 0, 0, 0, 0];
        data.push(crc8(&data));
        assert_eq!(decoder.decode(&data, start, Utc::now()), Decoded::Nothing);

        assert_eq!(decoder.next_command_due(), None);
        assert!(decoder.take_due_command(start + Duration::from_secs(5)).is_none());
    }
}
