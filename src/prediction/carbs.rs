//! Linear carbohydrate absorption.

use chrono::{DateTime, Utc};

use crate::history::Treatment;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarbModel {
    /// Time for an entry to absorb completely when uncapped (minutes).
    pub absorption_min: f64,
    /// Ceiling on the absorption rate of a single entry (g/min).
    pub max_g_per_min: f64,
}

impl CarbModel {
    /// Grams of a `grams` entry still unabsorbed `t` minutes after it was
    /// eaten.
    pub fn remaining(&self, grams: f64, t: f64) -> f64 {
        if t <= 0.0 {
            return grams;
        }
        let rate = (grams / self.absorption_min).min(self.max_g_per_min);
        (grams - rate * t).max(0.0)
    }
}

/// Carb entries eaten up to `now`, as `(timestamp, grams)`.
pub fn carb_entries(treatments: &[Treatment], now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
    treatments
        .iter()
        .filter_map(|t| match *t {
            Treatment::CarbEntry { grams, timestamp } if timestamp <= now => Some((timestamp, grams)),
            _ => None,
        })
        .collect()
}

/// Carbs on board at `at`.
pub fn cob_at(entries: &[(DateTime<Utc>, f64)], model: &CarbModel, at: DateTime<Utc>) -> f64 {
    entries
        .iter()
        .map(|&(ts, grams)| model.remaining(grams, (at - ts).num_milliseconds() as f64 / 60_000.0))
        .sum::<f64>()
        .max(0.0)
}
