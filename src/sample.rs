//! # Heart Rate Sample Module
//!
//! The unit of data that flows through the whole system, plus the pieces of
//! protocol and time arithmetic that every other module shares:
//!
//! - `Sample`: one immutable reading `{timestamp, bpm, source}`
//! - `SampleClock`: non-decreasing millisecond clock used to stamp samples
//! - `Granularity` / `AggregateBucket`: calendar-aligned trend buckets
//! - `parse_heart_rate_measurement`: decoder for the 0x2A37 characteristic
//!
//! Timestamps are milliseconds since the Unix epoch (UTC).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Lowest reading accepted as a real heart rate
pub const MIN_PLAUSIBLE_BPM: u16 = 30;
/// Highest reading accepted as a real heart rate
pub const MAX_PLAUSIBLE_BPM: u16 = 220;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Where a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Real,
    Mock,
}

impl Source {
    /// Value stored in the `source` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Real => "REAL",
            Source::Mock => "MOCK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REAL" => Some(Source::Real),
            "MOCK" => Some(Source::Mock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub bpm: u16,
    pub source: Source,
}

impl Sample {
    pub fn new(timestamp: i64, bpm: u16, source: Source) -> Self {
        Self { timestamp, bpm, source }
    }

    pub fn is_plausible(bpm: u16) -> bool {
        (MIN_PLAUSIBLE_BPM..=MAX_PLAUSIBLE_BPM).contains(&bpm)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wall clock that never goes backwards.
///
/// Queries rely on timestamps growing with arrival order, so a clock step
/// backwards (NTP, suspend) repeats the last value instead.
#[derive(Debug, Default)]
pub struct SampleClock {
    last: AtomicI64,
}

impl SampleClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> i64 {
        self.observe(now_ms())
    }

    /// Fold a raw reading into the clock and return the stamped value
    pub fn observe(&self, wall: i64) -> i64 {
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }
}

/// Width of a trend bucket. Buckets are aligned to UTC calendar boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn period_ms(&self) -> i64 {
        match self {
            Granularity::Minute => MINUTE_MS,
            Granularity::Hour => HOUR_MS,
            Granularity::Day => DAY_MS,
        }
    }

    /// Start of the half-open bucket `[start, start + period)` holding `timestamp`
    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.period_ms())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    pub bucket_start: i64,
    pub count: u64,
    pub sum_bpm: u64,
    pub avg_bpm: f64,
}

impl AggregateBucket {
    pub fn new(bucket_start: i64, count: u64, sum_bpm: u64) -> Self {
        let avg_bpm = if count == 0 { 0.0 } else { sum_bpm as f64 / count as f64 };
        Self { bucket_start, count, sum_bpm, avg_bpm }
    }

    /// Fold more readings into this bucket
    pub fn merge(&mut self, count: u64, sum_bpm: u64) {
        *self = Self::new(self.bucket_start, self.count + count, self.sum_bpm + sum_bpm);
    }
}

/// Decode a Heart Rate Measurement (0x2A37) notification payload.
///
/// Bit 0 of the flags byte selects an 8-bit or a little-endian 16-bit value.
/// Energy expended and RR intervals that may follow are ignored.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Option<u16> {
    let flags = *data.first()?;
    if flags & 0x01 == 0 {
        data.get(1).map(|&bpm| bpm as u16)
    } else {
        let bytes = data.get(1..3)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}
