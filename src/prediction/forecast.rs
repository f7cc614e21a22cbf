//! Predicted glucose from the current status and the IOB/COB curves.
//!
//! ```text
//! bg(t) = bg(0) - (IOB(0) - IOB(t)) · ISF + (COB(0) - COB(t)) · ISF / CR + momentum(t)
//! ```
//!
//! The momentum term carries the part of the recent trend that insulin
//! does not explain (`avg_delta - expected insulin delta`) forward with a
//! linearly decaying weight, reaching zero after [`MOMENTUM_STEPS`] steps.

use serde::{Deserialize, Serialize};

use super::{PredictionCurve, Predictions, STEP_MIN};
use crate::history::GlucoseStatus;

/// Steps over which the unexplained trend fades out (6 × 5 min).
pub const MOMENTUM_STEPS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseForecast {
    pub curve: PredictionCurve,
    /// Observed minus insulin-expected delta over the last 5 minutes.
    pub deviation: f64,
}

impl GlucoseForecast {
    /// Predicted glucose at the end of the horizon.
    pub fn eventual(&self) -> f64 {
        self.curve.last()
    }

    pub fn min_within(&self, horizon_min: u32) -> f64 {
        self.curve.min_within(horizon_min)
    }
}

/// Forecast glucose at every step of the prediction curves.
pub fn forecast_glucose(status: &GlucoseStatus, predictions: &Predictions, isf: f64, carb_ratio: f64) -> GlucoseForecast {
    let bg = status.value;
    let iob0 = predictions.iob.now();
    let cob0 = predictions.cob.now();
    let csf = isf / carb_ratio;

    let expected_delta = -predictions.first_step_iob_drop() * isf;
    let deviation = status.short_avg_delta - expected_delta;

    let horizon = predictions.iob.points().last().map_or(0, |p| p.offset_min);
    let curve = PredictionCurve::sample(horizon, |offset| {
        let step = offset / STEP_MIN;
        let insulin_effect = (iob0 - predictions.iob.value_at(offset)) * isf;
        let carb_effect = (cob0 - predictions.cob.value_at(offset)) * csf;
        bg - insulin_effect + carb_effect + momentum(deviation, step)
    });

    GlucoseForecast { curve, deviation }
}

/// Accumulated momentum after `step` steps.
fn momentum(deviation: f64, step: u32) -> f64 {
    (1..=step.min(MOMENTUM_STEPS - 1))
        .map(|j| deviation * (1.0 - f64::from(j) / f64::from(MOMENTUM_STEPS)))
        .sum()
}
