//! Dual-timeframe RMSSD engine
//!
//! Two independent windows see the same intervals. The quick window answers
//! early with a rough figure; the real window needs a few minutes of beats
//! but gives a stable one. Each recomputes on its own throttle and keeps its
//! latest result as the current value until the next computation replaces it.

use super::window::SlidingWindow;
use crate::constants::hrv as defaults;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataQuality {
    Insufficient,
    Low,
    Medium,
    High,
    Excellent,
}

impl DataQuality {
    pub fn from_count(count: usize) -> Self {
        match count {
            0..=9 => DataQuality::Insufficient,
            10..=29 => DataQuality::Low,
            30..=59 => DataQuality::Medium,
            60..=149 => DataQuality::High,
            _ => DataQuality::Excellent,
        }
    }
}

/// Confidence staging by interval count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    pub min_intervals: usize,
    pub confidence: f64,
    pub description: &'static str,
}

pub const STAGES: [Stage; 6] = [
    Stage { min_intervals: 0, confidence: 0.0, description: "Collecting data" },
    Stage { min_intervals: 10, confidence: 0.4, description: "Initial estimate" },
    Stage { min_intervals: 30, confidence: 0.6, description: "Stabilizing" },
    Stage { min_intervals: 60, confidence: 0.85, description: "Reliable" },
    Stage { min_intervals: 150, confidence: 0.95, description: "High confidence" },
    Stage { min_intervals: 300, confidence: 0.98, description: "Research grade" },
];

pub fn stage_for(count: usize) -> &'static Stage {
    STAGES
        .iter()
        .rev()
        .find(|stage| count >= stage.min_intervals)
        .unwrap_or(&STAGES[0])
}

/// Root mean square of successive differences, rounded to 0.1 ms
pub fn rmssd(intervals: &[f64]) -> Option<f64> {
    if intervals.len() < 2 {
        return None;
    }
    let sum_sq: f64 = intervals
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).powi(2))
        .sum();
    let mean = sum_sq / (intervals.len() - 1) as f64;
    Some((mean.sqrt() * 10.0).round() / 10.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Timeframe {
    Quick,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeframeConfig {
    pub capacity: usize,
    pub min_intervals: usize,
    pub throttle: Duration,
}

impl TimeframeConfig {
    pub const QUICK: Self = Self {
        capacity: defaults::QUICK_CAPACITY,
        min_intervals: defaults::QUICK_MIN_INTERVALS,
        throttle: defaults::QUICK_THROTTLE,
    };

    pub const REAL: Self = Self {
        capacity: defaults::REAL_CAPACITY,
        min_intervals: defaults::REAL_MIN_INTERVALS,
        throttle: defaults::REAL_THROTTLE,
    };
}

/// Immutable HRV snapshot; later computations supersede it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HrvResult {
    pub timeframe: Timeframe,
    pub rmssd: f64,
    pub interval_count: usize,
    pub quality: DataQuality,
    pub confidence: f64,
    pub stage: &'static str,
    pub window_span: Duration,
    pub computed_at: DateTime<Utc>,
}

/// Current results of both timeframes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HrvSnapshot {
    pub quick: Option<HrvResult>,
    pub real: Option<HrvResult>,
}

impl HrvSnapshot {
    pub fn is_empty(&self) -> bool {
        self.quick.is_none() && self.real.is_none()
    }
}

#[derive(Debug, Clone)]
struct TimeframeTracker {
    timeframe: Timeframe,
    config: TimeframeConfig,
    window: SlidingWindow,
    last_computed: Option<DateTime<Utc>>,
    current: Option<HrvResult>,
}

impl TimeframeTracker {
    fn new(timeframe: Timeframe, config: TimeframeConfig) -> Self {
        Self {
            timeframe,
            config,
            window: SlidingWindow::new(config.capacity),
            last_computed: None,
            current: None,
        }
    }

    fn throttled(&self, now: DateTime<Utc>) -> bool {
        match self.last_computed {
            Some(last) => (now - last).to_std().unwrap_or_default() < self.config.throttle,
            None => false,
        }
    }

    fn maybe_compute(&mut self, now: DateTime<Utc>) -> Option<HrvResult> {
        let count = self.window.len();
        if count < self.config.min_intervals || self.throttled(now) {
            return None;
        }
        let value = rmssd(&self.window.intervals())?;
        let stage = stage_for(count);

        let result = HrvResult {
            timeframe: self.timeframe,
            rmssd: value,
            interval_count: count,
            quality: DataQuality::from_count(count),
            confidence: stage.confidence,
            stage: stage.description,
            window_span: self.window.timespan(),
            computed_at: now,
        };
        self.last_computed = Some(now);
        self.current = Some(result.clone());
        Some(result)
    }

    fn reset(&mut self) {
        self.window.clear();
        self.last_computed = None;
        self.current = None;
    }
}

/// Outcome of ingesting one batch of intervals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HrvUpdate {
    pub accepted: usize,
    pub rejected: usize,
    /// Present only when the timeframe recomputed during this batch
    pub quick: Option<HrvResult>,
    pub real: Option<HrvResult>,
}

#[derive(Debug, Clone)]
pub struct HrvEngine {
    quick: TimeframeTracker,
    real: TimeframeTracker,
}

impl Default for HrvEngine {
    fn default() -> Self {
        Self::new(TimeframeConfig::QUICK, TimeframeConfig::REAL)
    }
}

impl HrvEngine {
    pub fn new(quick: TimeframeConfig, real: TimeframeConfig) -> Self {
        Self {
            quick: TimeframeTracker::new(Timeframe::Quick, quick),
            real: TimeframeTracker::new(Timeframe::Real, real),
        }
    }

    /// Feed intervals received at `received_at`. The last interval ends at
    /// `received_at`; earlier ones are stamped backwards by cumulative length.
    pub fn ingest(&mut self, intervals: &[f64], received_at: DateTime<Utc>) -> HrvUpdate {
        let mut update = HrvUpdate::default();
        if intervals.is_empty() {
            return update;
        }

        let mut offset_ms = 0.0;
        let mut stamped: Vec<(f64, DateTime<Utc>)> = intervals
            .iter()
            .rev()
            .map(|&interval| {
                let stamp = received_at - chrono::Duration::microseconds((offset_ms * 1000.0) as i64);
                if interval.is_finite() && interval > 0.0 {
                    offset_ms += interval;
                }
                (interval, stamp)
            })
            .collect();
        stamped.reverse();

        for (interval, stamp) in stamped {
            let quick = self.quick.window.add(interval, stamp);
            let real = self.real.window.add(interval, stamp);
            if quick.is_ok() && real.is_ok() {
                update.accepted += 1;
            } else {
                debug!("Rejected inter-beat interval {:.1} ms", interval);
                update.rejected += 1;
            }
        }

        update.quick = self.quick.maybe_compute(received_at);
        update.real = self.real.maybe_compute(received_at);

        if let Some(result) = &update.real {
            info!(
                "📈 Real HRV: RMSSD {:.1} ms over {} intervals ({})",
                result.rmssd, result.interval_count, result.stage
            );
        } else if let Some(result) = &update.quick {
            debug!(
                "Quick HRV: RMSSD {:.1} ms over {} intervals",
                result.rmssd, result.interval_count
            );
        }
        update
    }

    pub fn snapshot(&self) -> HrvSnapshot {
        HrvSnapshot {
            quick: self.quick.current.clone(),
            real: self.real.current.clone(),
        }
    }

    pub fn interval_counts(&self) -> (usize, usize) {
        (self.quick.window.len(), self.real.window.len())
    }

    pub fn reset(&mut self) {
        self.quick.reset();
        self.real.reset();
    }
}
