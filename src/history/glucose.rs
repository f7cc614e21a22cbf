//! Current glucose status derived from the tail of the reading history.
//!
//! Deltas are normalised to mg/dL per 5 minutes, the native CGM cadence.
//! Optional exponential smoothing is applied oldest-to-newest before the
//! deltas are taken.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GlucoseReading;
use crate::config::SmoothingKind;

/// CGM trend arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    DoubleDown,
    SingleDown,
    FortyFiveDown,
    Flat,
    FortyFiveUp,
    SingleUp,
    DoubleUp,
    NotComputable,
}

impl TrendDirection {
    /// Arrow matching a per-5-minute delta, using the usual 1/2/3 mg/dL
    /// per minute boundaries.
    pub fn from_delta(delta_per_5min: f64) -> Self {
        let per_min = delta_per_5min / 5.0;
        if !per_min.is_finite() {
            Self::NotComputable
        } else if per_min <= -3.0 {
            Self::DoubleDown
        } else if per_min <= -2.0 {
            Self::SingleDown
        } else if per_min <= -1.0 {
            Self::FortyFiveDown
        } else if per_min < 1.0 {
            Self::Flat
        } else if per_min < 2.0 {
            Self::FortyFiveUp
        } else if per_min < 3.0 {
            Self::SingleUp
        } else {
            Self::DoubleUp
        }
    }
}

/// Snapshot of where glucose is and where it is heading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseStatus {
    /// mg/dL (smoothed when smoothing is enabled)
    pub value: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Change against readings 2.5–7.5 min old
    pub delta: f64,
    /// Change against readings 2.5–17.5 min old
    pub short_avg_delta: f64,
    /// Change against readings 17.5–42.5 min old
    pub long_avg_delta: f64,
}

/// Lookback needed to build a status (minutes).
pub const STATUS_LOOKBACK_MIN: i64 = 45;

impl GlucoseStatus {
    /// Build a status from readings ordered oldest first.  Returns `None`
    /// when there are no readings.
    pub fn from_readings(readings: &[GlucoseReading], smoothing: SmoothingKind) -> Option<Self> {
        let newest = readings.last()?;
        let cutoff = newest.timestamp - chrono::Duration::minutes(STATUS_LOOKBACK_MIN);
        let start = readings.partition_point(|r| r.timestamp < cutoff);
        let tail = &readings[start..];

        let values = smooth(tail, smoothing);
        let Some(&now_value) = values.last() else {
            return None;
        };

        let mut delta = Window::default();
        let mut short = Window::default();
        let mut long = Window::default();

        for (reading, &value) in tail.iter().zip(&values).rev().skip(1) {
            let minutes_ago = (newest.timestamp - reading.timestamp).num_seconds() as f64 / 60.0;
            if minutes_ago <= 2.5 {
                continue;
            }
            let per_5 = (now_value - value) / minutes_ago * 5.0;
            if minutes_ago <= 7.5 {
                delta.push(per_5);
            }
            if minutes_ago <= 17.5 {
                short.push(per_5);
            } else if minutes_ago <= 42.5 {
                long.push(per_5);
            }
        }

        let short_avg_delta = short.mean();
        Some(Self {
            value: now_value,
            timestamp: newest.timestamp,
            delta: if delta.count > 0 { delta.mean() } else { short_avg_delta },
            short_avg_delta,
            long_avg_delta: long.mean(),
        })
    }
}

#[derive(Default)]
struct Window {
    sum: f64,
    count: u32,
}

impl Window {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum / f64::from(self.count) }
    }
}

fn smooth(readings: &[GlucoseReading], smoothing: SmoothingKind) -> Vec<f64> {
    match smoothing {
        SmoothingKind::None => readings.iter().map(|r| r.value).collect(),
        SmoothingKind::Exponential { alpha } => {
            let mut out = Vec::with_capacity(readings.len());
            let mut prev: Option<f64> = None;
            for r in readings {
                let s = prev.map_or(r.value, |p| alpha * r.value + (1.0 - alpha) * p);
                out.push(s);
                prev = Some(s);
            }
            out
        }
    }
}
