//! Autosens: sensitivity ratio from observed vs. insulin-expected deltas.
//!
//! For each consecutive pair of readings roughly five minutes apart in the
//! trailing window the estimator compares the observed change with the
//! change insulin activity alone would explain.  Intervals with carbs on
//! board are skipped.  The median deviation is converted into a
//! basal-equivalent and the ratio is `1 + offset / basal`, clamped to the
//! configured band.  With too few usable intervals the ratio is 1.0.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::LoopConfig;
use crate::history::HistoryWindow;
use crate::prediction::carbs::{self, CarbModel};
use crate::prediction::insulin::{self, InsulinCurve};
use crate::profile::Profile;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutosensSettings {
    pub window_hours: u32,
    pub min_samples: u32,
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub carbs: CarbModel,
}

impl AutosensSettings {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            window_hours: config.autosens_window_hours,
            min_samples: config.autosens_min_samples,
            min_ratio: config.autosens_min_ratio,
            max_ratio: config.autosens_max_ratio,
            carbs: CarbModel {
                absorption_min: f64::from(config.carb_absorption_min),
                max_g_per_min: config.max_carb_absorption_g_per_min,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Autosens {
    pub ratio: f64,
    /// Intervals the ratio was computed from (0 when it fell back to 1.0).
    pub samples: u32,
}

impl Autosens {
    pub const NEUTRAL: Self = Self { ratio: 1.0, samples: 0 };

    /// A higher ratio means more resistance, so the ISF shrinks.
    pub fn adjust_isf(&self, isf: f64) -> f64 {
        isf / self.ratio
    }

    pub fn adjust_basal(&self, basal: f64) -> f64 {
        basal * self.ratio
    }
}

/// Estimate the sensitivity ratio as of `now`.
pub fn estimate(history: &HistoryWindow, profile: &Profile, now: DateTime<Utc>, settings: &AutosensSettings) -> Autosens {
    let Ok(curve) = InsulinCurve::for_profile(profile) else {
        return Autosens::NEUTRAL;
    };
    let doses = insulin::insulin_doses(&history.treatments, profile, now);
    let meals = carbs::carb_entries(&history.treatments, now);

    let window_start = now - Duration::hours(i64::from(settings.window_hours));
    let from = history.glucose.partition_point(|g| g.timestamp < window_start);
    let readings = &history.glucose[from..];

    let mut deviations: Vec<f64> = readings
        .windows(2)
        .filter_map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            let gap_min = (cur.timestamp - prev.timestamp).num_seconds() as f64 / 60.0;
            if !(4.0..=6.0).contains(&gap_min) {
                return None;
            }
            let eaten: Vec<_> = meals.iter().copied().filter(|(ts, _)| *ts <= cur.timestamp).collect();
            if carbs::cob_at(&eaten, &settings.carbs, cur.timestamp) > 0.0 {
                return None;
            }
            let isf = profile.slice_at(cur.timestamp).isf;
            let observed = (cur.value - prev.value) / gap_min * 5.0;
            let expected = -insulin::activity_at(&doses, &curve, cur.timestamp) * 5.0 * isf;
            let d = observed - expected;
            d.is_finite().then_some(d)
        })
        .collect();

    let samples = deviations.len() as u32;
    if samples < settings.min_samples.max(1) {
        debug!("autosens: {samples} usable intervals, need {}; ratio 1.0", settings.min_samples);
        return Autosens::NEUTRAL;
    }

    deviations.sort_by(f64::total_cmp);
    let median = if deviations.len() % 2 == 0 {
        let mid = deviations.len() / 2;
        (deviations[mid - 1] + deviations[mid]) / 2.0
    } else {
        deviations[deviations.len() / 2]
    };

    let slice = profile.slice_at(now);
    if slice.basal_rate <= 0.0 {
        return Autosens::NEUTRAL;
    }
    // mg/dL per 5 min → U/h of basal that would produce it
    let basal_offset = median * 12.0 / slice.isf;
    let raw = 1.0 + basal_offset / slice.basal_rate;
    if !raw.is_finite() {
        return Autosens::NEUTRAL;
    }
    let ratio = raw.clamp(settings.min_ratio, settings.max_ratio);
    debug!("autosens: median deviation {median:.2} over {samples} intervals, ratio {ratio:.2}");
    Autosens { ratio, samples }
}
