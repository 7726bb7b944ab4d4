//! Heart-rate variability from inter-beat intervals

pub mod engine;
pub mod window;

pub use engine::{
    rmssd, stage_for, DataQuality, HrvEngine, HrvResult, HrvSnapshot, HrvUpdate, Timeframe,
    TimeframeConfig,
};
pub use window::{is_valid_interval, IntervalRejected, IntervalSample, SlidingWindow};
