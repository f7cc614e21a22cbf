//! Low-glucose suspend: the most conservative strategy.  Zero temp basal
//! while a low is forecast, scheduled basal otherwise, never a bolus.

use super::{DosingInput, DosingStrategy, RawRecommendation};
use crate::error::AlgorithmError;

#[derive(Debug, Default, Clone, Copy)]
pub struct LowGlucoseSuspend;

impl DosingStrategy for LowGlucoseSuspend {
    fn name(&self) -> &'static str {
        "low_glucose_suspend"
    }

    fn decide(&self, input: &DosingInput<'_>) -> Result<RawRecommendation, AlgorithmError> {
        let bg = input.glucose.value;
        if bg < input.slice.target_low && input.glucose.delta < 0.0 {
            return Ok(RawRecommendation::suspend("below target and falling"));
        }
        if input.predicted_min() < input.limits.hard_floor_mgdl {
            return Ok(RawRecommendation::suspend("forecast below hard floor"));
        }
        Ok(RawRecommendation {
            temp_basal_rate: input.scheduled_basal(),
            bolus: 0.0,
            reason: "no low forecast",
        })
    }
}
