//! Reference strategy: set a temp basal from the eventual forecast.
//!
//! 1. Suspend when glucose is under target and still falling, or when the
//!    forecast crosses the hard floor within the safety horizon.
//! 2. Keep scheduled basal when the eventual forecast is inside the
//!    target range.
//! 3. Otherwise deliver `(eventual - mid target) / ISF` on top of the
//!    neutral basal, spread over one temp basal duration.  With micro
//!    boluses enabled, part of a positive requirement goes out as a bolus
//!    and only the rest is added to the rate.

use super::{DosingInput, DosingStrategy, RawRecommendation};
use crate::error::AlgorithmError;

#[derive(Debug, Default, Clone, Copy)]
pub struct PredictiveBasal;

impl DosingStrategy for PredictiveBasal {
    fn name(&self) -> &'static str {
        "predictive_basal"
    }

    fn decide(&self, input: &DosingInput<'_>) -> Result<RawRecommendation, AlgorithmError> {
        if input.isf <= 0.0 || !input.isf.is_finite() {
            return Err(AlgorithmError::InsufficientInput("isf must be positive"));
        }
        let bg = input.glucose.value;
        let slice = input.slice;

        if bg < slice.target_low && input.glucose.delta < 0.0 {
            return Ok(RawRecommendation::suspend("below target and falling"));
        }
        if input.predicted_min() < input.limits.hard_floor_mgdl {
            return Ok(RawRecommendation::suspend("forecast below hard floor"));
        }

        let eventual = input.forecast.eventual();
        if (slice.target_low..=slice.target_high).contains(&eventual) {
            return Ok(RawRecommendation {
                temp_basal_rate: input.scheduled_basal(),
                bolus: 0.0,
                reason: "eventual in range",
            });
        }

        let insulin_req = (eventual - slice.target_mid()) / input.isf;
        let hours = f64::from(input.limits.temp_basal_duration_min) / 60.0;

        let (bolus, via_rate, reason) = if insulin_req > 0.0 && input.limits.micro_bolus_enabled {
            let bolus = insulin_req * input.limits.micro_bolus_fraction;
            (bolus, insulin_req - bolus, "high: micro-bolus plus temp")
        } else if insulin_req > 0.0 {
            (0.0, insulin_req, "high: raise temp")
        } else {
            (0.0, insulin_req, "low: reduce temp")
        };

        let rate = (input.basal + via_rate / hours).clamp(0.0, input.max_rate());
        Ok(RawRecommendation { temp_basal_rate: rate, bolus, reason })
    }
}
