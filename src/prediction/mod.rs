//! Prediction engine: insulin-on-board and carbs-on-board curves.
//!
//! [`predict`] is a pure function of `(history, profile, now, settings)`.
//! It never reads a clock, so replaying the same inputs yields
//! bit-identical curves.

pub mod carbs;
pub mod forecast;
pub mod insulin;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LoopConfig;
use crate::error::ProfileError;
use crate::history::HistoryWindow;
use crate::profile::Profile;

pub use carbs::CarbModel;
pub use forecast::{GlucoseForecast, forecast_glucose};
pub use insulin::{InsulinCurve, InsulinDose};

/// Spacing between curve points (minutes).
pub const STEP_MIN: u32 = 5;

/// One `(offset, value)` sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub offset_min: u32,
    pub value: f64,
}

/// Values at 0, 5, 10, … minutes from `now`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PredictionCurve {
    points: Vec<CurvePoint>,
}

impl PredictionCurve {
    /// Sample `f(offset)` for every step up to and including `horizon_min`.
    pub fn sample(horizon_min: u32, mut f: impl FnMut(u32) -> f64) -> Self {
        let points = (0..=horizon_min / STEP_MIN)
            .map(|k| {
                let offset_min = k * STEP_MIN;
                CurvePoint { offset_min, value: f(offset_min) }
            })
            .collect();
        Self { points }
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Value at offset 0.
    pub fn now(&self) -> f64 {
        self.points.first().map_or(0.0, |p| p.value)
    }

    /// Value at the last sampled offset.
    pub fn last(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.value)
    }

    /// Value at the step containing `offset_min`, or the last value past
    /// the horizon.
    pub fn value_at(&self, offset_min: u32) -> f64 {
        let idx = (offset_min / STEP_MIN) as usize;
        self.points.get(idx).or(self.points.last()).map_or(0.0, |p| p.value)
    }

    /// Smallest value among offsets `<= horizon_min`.
    pub fn min_within(&self, horizon_min: u32) -> f64 {
        self.points
            .iter()
            .take_while(|p| p.offset_min <= horizon_min)
            .map(|p| p.value)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.value)
    }
}

/// Model parameters that come from the loop configuration rather than the
/// profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionSettings {
    pub horizon_min: u32,
    pub carbs: CarbModel,
}

impl PredictionSettings {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            horizon_min: config.prediction_horizon_min,
            carbs: CarbModel {
                absorption_min: f64::from(config.carb_absorption_min),
                max_g_per_min: config.max_carb_absorption_g_per_min,
            },
        }
    }
}

/// IOB and COB curves for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    pub iob: PredictionCurve,
    pub cob: PredictionCurve,
    pub insulin: InsulinCurve,
    /// Flattened insulin deliveries the IOB curve was built from.
    pub doses: Vec<InsulinDose>,
}

impl Predictions {
    /// Change in IOB over the first step, i.e. insulin absorbed in the next
    /// five minutes.
    pub fn first_step_iob_drop(&self) -> f64 {
        self.iob.now() - self.iob.value_at(STEP_MIN)
    }
}

/// Build the IOB and COB curves from `history` as seen at `now`.
pub fn predict(
    history: &HistoryWindow,
    profile: &Profile,
    now: DateTime<Utc>,
    settings: &PredictionSettings,
) -> Result<Predictions, ProfileError> {
    let insulin = InsulinCurve::for_profile(profile)?;
    let doses = insulin::insulin_doses(&history.treatments, profile, now);
    let meals = carbs::carb_entries(&history.treatments, now);

    let at = |offset: u32| now + Duration::minutes(i64::from(offset));
    let iob = PredictionCurve::sample(settings.horizon_min, |off| insulin::iob_at(&doses, &insulin, at(off)));
    let cob = PredictionCurve::sample(settings.horizon_min, |off| carbs::cob_at(&meals, &settings.carbs, at(off)));

    Ok(Predictions { iob, cob, insulin, doses })
}
