//! Fixed-capacity FIFO of validated inter-beat intervals

use crate::constants::ranges;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("inter-beat interval {0} ms outside accepted range")]
pub struct IntervalRejected(pub f64);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalSample {
    pub interval_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Interval corresponds to 30-200 BPM
pub fn is_valid_interval(interval_ms: f64) -> bool {
    (ranges::IBI_MIN_MS..=ranges::IBI_MAX_MS).contains(&interval_ms)
}

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<IntervalSample>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append an interval, evicting the oldest once over capacity.
    /// Out-of-range intervals are rejected and leave the window untouched.
    pub fn add(&mut self, interval_ms: f64, timestamp: DateTime<Utc>) -> Result<(), IntervalRejected> {
        if !is_valid_interval(interval_ms) {
            return Err(IntervalRejected(interval_ms));
        }
        self.samples.push_back(IntervalSample {
            interval_ms,
            timestamp,
        });
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// All intervals, oldest first
    pub fn intervals(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.interval_ms).collect()
    }

    /// The newest `n` intervals, oldest first
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).map(|s| s.interval_ms).collect()
    }

    pub fn samples(&self) -> impl Iterator<Item = &IntervalSample> {
        self.samples.iter()
    }

    /// Newest timestamp minus oldest
    pub fn timespan(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some(oldest), Some(newest)) => (newest.timestamp - oldest.timestamp)
                .to_std()
                .unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
