//! Command scheduling for the framed protocol.
//!
//! Some firmware streams as soon as notifications are enabled, some waits to
//! be asked. After subscribing we give the device a grace period; if nothing
//! structured has arrived by then, we send device-info, ping and real-time
//! requests a short delay apart and then poll real-time data at a fixed
//! interval. Unanswered polls are simply superseded by the next one.

use super::framed::FramedCommand;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTiming {
    /// Wait for unsolicited data before bootstrapping
    pub grace: Duration,
    /// Gap between bootstrap commands
    pub step_delay: Duration,
    /// Real-time poll interval once bootstrapped
    pub poll_interval: Duration,
}

impl Default for ScheduleTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1500),
            step_delay: Duration::from_millis(300),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingData { deadline: Instant },
    Bootstrapping { queue: VecDeque<FramedCommand>, next: Instant },
    Polling { next: Instant },
    /// Device streams on its own, nothing to send
    Streaming,
}

#[derive(Debug, Clone)]
pub struct CommandSchedule {
    phase: Phase,
    timing: ScheduleTiming,
}

impl CommandSchedule {
    pub fn new(subscribed_at: Instant, timing: ScheduleTiming) -> Self {
        Self {
            phase: Phase::AwaitingData {
                deadline: subscribed_at + timing.grace,
            },
            timing,
        }
    }

    /// A structured response arrived. Before the grace period ends this
    /// means the device streams unprompted.
    pub fn note_structured_data(&mut self) {
        if matches!(self.phase, Phase::AwaitingData { .. }) {
            debug!("Device streams unprompted, no command bootstrap needed");
            self.phase = Phase::Streaming;
        }
    }

    /// When the next command falls due, if any
    pub fn next_due(&self) -> Option<Instant> {
        match &self.phase {
            Phase::AwaitingData { deadline } => Some(*deadline),
            Phase::Bootstrapping { next, .. } | Phase::Polling { next } => Some(*next),
            Phase::Streaming => None,
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.phase, Phase::Polling { .. })
    }

    /// Command to send at `now`, advancing the schedule
    pub fn poll(&mut self, now: Instant) -> Option<FramedCommand> {
        let due = self.next_due()?;
        if now < due {
            return None;
        }

        match &mut self.phase {
            Phase::AwaitingData { .. } => {
                debug!("No unsolicited data, bootstrapping command sequence");
                self.phase = Phase::Bootstrapping {
                    queue: VecDeque::from([FramedCommand::Ping, FramedCommand::RealTime]),
                    next: now + self.timing.step_delay,
                };
                Some(FramedCommand::DeviceInfo)
            }
            Phase::Bootstrapping { queue, next } => {
                let command = queue.pop_front();
                if queue.is_empty() {
                    self.phase = Phase::Polling {
                        next: now + self.timing.poll_interval,
                    };
                } else {
                    *next = now + self.timing.step_delay;
                }
                command
            }
            Phase::Polling { next } => {
                *next = now + self.timing.poll_interval;
                Some(FramedCommand::RealTime)
            }
            Phase::Streaming => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_bootstrap_sequence_then_polling() {
        let start = Instant::now();
        let timing = ScheduleTiming::default();
        let mut schedule = CommandSchedule::new(start, timing);

        assert_eq!(schedule.poll(start + ms(1000)), None);

        let t = start + ms(1500);
        assert_eq!(schedule.poll(t), Some(FramedCommand::DeviceInfo));
        assert_eq!(schedule.poll(t + ms(100)), None);
        assert_eq!(schedule.poll(t + ms(300)), Some(FramedCommand::Ping));
        assert_eq!(schedule.poll(t + ms(600)), Some(FramedCommand::RealTime));
        assert!(schedule.is_polling());

        assert_eq!(schedule.poll(t + ms(1000)), None);
        assert_eq!(schedule.poll(t + ms(1600)), Some(FramedCommand::RealTime));
        assert_eq!(schedule.poll(t + ms(2600)), Some(FramedCommand::RealTime));
    }

    #[test]
    fn test_unsolicited_data_skips_bootstrap() {
        let start = Instant::now();
        let mut schedule = CommandSchedule::new(start, ScheduleTiming::default());
        schedule.note_structured_data();

        assert_eq!(schedule.next_due(), None);
        assert_eq!(schedule.poll(start + ms(10_000)), None);
    }

    #[test]
    fn test_structured_data_after_bootstrap_keeps_polling() {
        let start = Instant::now();
        let mut schedule = CommandSchedule::new(start, ScheduleTiming::default());
        schedule.poll(start + ms(1500));
        schedule.note_structured_data();
        assert_eq!(schedule.poll(start + ms(1800)), Some(FramedCommand::Ping));
    }
}
