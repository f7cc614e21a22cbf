//! Dosing algorithm interface and the guard around it.
//!
//! A strategy turns the current glucose status, the IOB/COB curves and the
//! forecast into a [`RawRecommendation`].  Strategies are untrusted:
//! [`run_guarded`] catches panics and rejects any output that is
//! non-finite, outside `[0, scheduled basal × max multiplier]`, a negative
//! bolus, or a bolus while the forecast dips below the hard floor.  A
//! rejected output means "no recommendation" and the cycle falls back to
//! baseline.

pub mod decision;
pub mod predictive;
pub mod suspend;

use std::panic::{AssertUnwindSafe, catch_unwind};

use log::{debug, error, warn};

use crate::config::{LoopConfig, StrategyKind};
use crate::error::AlgorithmError;
use crate::history::GlucoseStatus;
use crate::prediction::{GlucoseForecast, Predictions};
use crate::profile::ProfileSlice;

pub use decision::{Applied, BasalDirective, DosingDecision, Edge, RationaleEntry, ReasonText, Requested, SourceId};
pub use predictive::PredictiveBasal;
pub use suspend::LowGlucoseSuspend;

/// Tolerance used when checking strategy output against its range.
const RANGE_EPSILON: f64 = 1e-9;

/// Configuration values a strategy is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DosingLimits {
    pub max_basal_multiplier: f64,
    pub hard_floor_mgdl: f64,
    pub safety_horizon_min: u32,
    pub temp_basal_duration_min: u32,
    pub micro_bolus_enabled: bool,
    pub micro_bolus_fraction: f64,
}

impl DosingLimits {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            max_basal_multiplier: config.max_basal_multiplier,
            hard_floor_mgdl: config.hard_floor_mgdl,
            safety_horizon_min: config.safety_horizon_min,
            temp_basal_duration_min: config.temp_basal_duration_min,
            micro_bolus_enabled: config.micro_bolus_enabled,
            micro_bolus_fraction: config.micro_bolus_fraction,
        }
    }
}

/// Everything a strategy decides from.
#[derive(Debug, Clone, Copy)]
pub struct DosingInput<'a> {
    pub glucose: &'a GlucoseStatus,
    pub predictions: &'a Predictions,
    pub forecast: &'a GlucoseForecast,
    /// Profile slice in force now (targets, scheduled basal).
    pub slice: &'a ProfileSlice,
    /// Sensitivity-adjusted ISF.
    pub isf: f64,
    /// Sensitivity-adjusted neutral basal.
    pub basal: f64,
    pub limits: DosingLimits,
}

impl DosingInput<'_> {
    pub fn scheduled_basal(&self) -> f64 {
        self.slice.basal_rate
    }

    /// Upper end of the range a strategy may recommend.
    pub fn max_rate(&self) -> f64 {
        self.slice.basal_rate * self.limits.max_basal_multiplier
    }

    /// Lowest forecast value within the safety horizon.
    pub fn predicted_min(&self) -> f64 {
        self.forecast.min_within(self.limits.safety_horizon_min)
    }
}

/// A strategy's unvalidated output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRecommendation {
    /// U/h
    pub temp_basal_rate: f64,
    /// U
    pub bolus: f64,
    pub reason: &'static str,
}

impl RawRecommendation {
    pub fn suspend(reason: &'static str) -> Self {
        Self { temp_basal_rate: 0.0, bolus: 0.0, reason }
    }
}

pub trait DosingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn decide(&self, input: &DosingInput<'_>) -> Result<RawRecommendation, AlgorithmError>;
}

/// Strategy selected by configuration.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn DosingStrategy> {
    match kind {
        StrategyKind::PredictiveBasal => Box::new(PredictiveBasal),
        StrategyKind::LowGlucoseSuspend => Box::new(LowGlucoseSuspend),
    }
}

/// Run `strategy` and validate what it returns.
pub fn run_guarded(strategy: &dyn DosingStrategy, input: &DosingInput<'_>) -> Result<RawRecommendation, AlgorithmError> {
    let raw = match catch_unwind(AssertUnwindSafe(|| strategy.decide(input))) {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            warn!("dosing: {} returned no recommendation: {e}", strategy.name());
            return Err(e);
        }
        Err(_) => {
            error!("dosing: {} panicked", strategy.name());
            return Err(AlgorithmError::Panicked);
        }
    };

    validate(&raw, input).inspect_err(|e| {
        warn!("dosing: {} output rejected ({e}): {raw:?}", strategy.name());
    })?;
    debug!(
        "dosing: {} → {:.2} U/h, bolus {:.2} U ({})",
        strategy.name(),
        raw.temp_basal_rate,
        raw.bolus,
        raw.reason
    );
    Ok(raw)
}

fn validate(raw: &RawRecommendation, input: &DosingInput<'_>) -> Result<(), AlgorithmError> {
    if !raw.temp_basal_rate.is_finite() || !raw.bolus.is_finite() {
        return Err(AlgorithmError::NonFinite);
    }
    if raw.temp_basal_rate < 0.0 || raw.temp_basal_rate > input.max_rate() + RANGE_EPSILON {
        return Err(AlgorithmError::RateOutOfRange);
    }
    if raw.bolus < 0.0 {
        return Err(AlgorithmError::NegativeBolus);
    }
    if raw.bolus > 0.0 && input.predicted_min() < input.limits.hard_floor_mgdl {
        return Err(AlgorithmError::BolusBelowFloor);
    }
    Ok(())
}
