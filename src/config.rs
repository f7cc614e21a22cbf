//! Loop configuration parameters
//!
//! All tunable parameters for the control loop.  Values can be loaded from
//! a JSON file through the [`ConfigPort`](crate::app::ports::ConfigPort)
//! or swapped at runtime with `LoopCommand::UpdateConfig`.  Every path
//! that accepts a new configuration runs [`LoopConfig::validate`] first.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which dosing strategy the loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    PredictiveBasal,
    LowGlucoseSuspend,
}

/// Smoothing applied to recent glucose readings before the status is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SmoothingKind {
    None,
    /// Single exponential smoothing with the given weight on the newest sample.
    Exponential { alpha: f64 },
}

/// Core loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    // --- Timing ---
    /// Normal loop period (seconds)
    pub loop_interval_secs: u32,
    /// Period used after a Failed cycle (seconds)
    pub expedited_retry_secs: u32,
    /// Maximum accepted age of the newest glucose reading (seconds)
    pub glucose_staleness_secs: u32,

    // --- Temp basal ---
    /// Duration of every temp basal issued (minutes)
    pub temp_basal_duration_min: u32,
    /// An identical active temp basal is re-issued only when fewer than
    /// this many minutes remain
    pub temp_basal_renew_min: u32,

    // --- Dispatcher ---
    /// Confirmation timeout for a single pump command (milliseconds)
    pub command_timeout_ms: u32,
    /// Retries after the first attempt
    pub command_max_retries: u8,
    /// First backoff delay; doubles per retry (milliseconds)
    pub retry_backoff_ms: u32,
    /// Backoff ceiling (milliseconds)
    pub retry_backoff_max_ms: u32,

    // --- User safety limits ---
    /// Temp basal ceiling as a multiple of scheduled basal
    pub max_basal_multiplier: f64,
    /// Absolute temp basal ceiling (U/h)
    pub max_basal_rate: f64,
    /// Largest single bolus the loop may issue (U)
    pub max_bolus: f64,
    /// Insulin-on-board ceiling (U)
    pub max_iob: f64,
    /// No bolus when the forecast falls below this (mg/dL)
    pub hard_floor_mgdl: f64,
    /// Window over which the forecast is checked against the floor (minutes)
    pub safety_horizon_min: u32,
    /// Longest forecast the loop looks at (minutes)
    pub prediction_horizon_min: u32,

    // --- Carbs ---
    /// Time for a carb entry to absorb fully (minutes)
    pub carb_absorption_min: u32,
    /// Ceiling on modelled absorption (g/min)
    pub max_carb_absorption_g_per_min: f64,

    // --- Autosens ---
    /// Trailing window the sensitivity estimator inspects (hours)
    pub autosens_window_hours: u32,
    /// Minimum usable 5-minute intervals before a ratio is produced
    pub autosens_min_samples: u32,
    pub autosens_min_ratio: f64,
    pub autosens_max_ratio: f64,

    // --- Strategy ---
    pub strategy: StrategyKind,
    /// Allow the strategy to deliver part of the requirement as a bolus
    pub micro_bolus_enabled: bool,
    /// Fraction of the insulin requirement delivered as micro-bolus
    pub micro_bolus_fraction: f64,
    /// Below this glucose no bolus of any size is allowed (mg/dL)
    pub min_bolus_glucose_mgdl: f64,
    pub smoothing: SmoothingKind,

    // --- Pump ---
    /// Registry name of the pump family driver
    pub pump_family: String,
    /// Reservoir below this level vetoes all dosing (U)
    pub reservoir_veto_units: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            // Timing
            loop_interval_secs: 300,    // 5 min, one CGM sample
            expedited_retry_secs: 60,
            glucose_staleness_secs: 720, // 12 min

            // Temp basal
            temp_basal_duration_min: 30,
            temp_basal_renew_min: 5,

            // Dispatcher
            command_timeout_ms: 10_000,
            command_max_retries: 3,
            retry_backoff_ms: 500,
            retry_backoff_max_ms: 4_000,

            // Limits
            max_basal_multiplier: 4.0,
            max_basal_rate: 5.0,
            max_bolus: 2.0,
            max_iob: 6.0,
            hard_floor_mgdl: 70.0,
            safety_horizon_min: 90,
            prediction_horizon_min: 240,

            // Carbs
            carb_absorption_min: 180,
            max_carb_absorption_g_per_min: 1.0,

            // Autosens
            autosens_window_hours: 8,
            autosens_min_samples: 24,
            autosens_min_ratio: 0.7,
            autosens_max_ratio: 1.2,

            // Strategy
            strategy: StrategyKind::PredictiveBasal,
            micro_bolus_enabled: false,
            micro_bolus_fraction: 0.5,
            min_bolus_glucose_mgdl: 80.0,
            smoothing: SmoothingKind::None,

            // Pump
            pump_family: "virtual".to_string(),
            reservoir_veto_units: 0.5,
        }
    }
}

impl LoopConfig {
    /// Range-check every field.  Invalid values are rejected, never
    /// clamped, so a bad file cannot quietly widen a safety limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg| Err(ConfigError::ValidationFailed(msg));

        if self.loop_interval_secs < 60 || self.loop_interval_secs > 900 {
            return fail("loop_interval_secs must be within 60..=900");
        }
        if self.expedited_retry_secs == 0 || self.expedited_retry_secs >= self.loop_interval_secs {
            return fail("expedited_retry_secs must be > 0 and shorter than loop_interval_secs");
        }
        if self.glucose_staleness_secs == 0 || self.glucose_staleness_secs > 1800 {
            return fail("glucose_staleness_secs must be within 1..=1800");
        }
        if self.temp_basal_duration_min < 15 || self.temp_basal_duration_min > 120 {
            return fail("temp_basal_duration_min must be within 15..=120");
        }
        if self.temp_basal_renew_min >= self.temp_basal_duration_min {
            return fail("temp_basal_renew_min must be shorter than temp_basal_duration_min");
        }
        if self.command_timeout_ms == 0 {
            return fail("command_timeout_ms must be > 0");
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return fail("retry_backoff_max_ms must be >= retry_backoff_ms");
        }
        if !(1.0..=10.0).contains(&self.max_basal_multiplier) {
            return fail("max_basal_multiplier must be within 1..=10");
        }
        if !finite_positive(self.max_basal_rate) || self.max_basal_rate > 35.0 {
            return fail("max_basal_rate must be within (0, 35]");
        }
        if !self.max_bolus.is_finite() || self.max_bolus < 0.0 || self.max_bolus > 25.0 {
            return fail("max_bolus must be within [0, 25]");
        }
        if !self.max_iob.is_finite() || self.max_iob < 0.0 || self.max_iob > 30.0 {
            return fail("max_iob must be within [0, 30]");
        }
        if !(40.0..=120.0).contains(&self.hard_floor_mgdl) {
            return fail("hard_floor_mgdl must be within 40..=120");
        }
        if self.safety_horizon_min < 30 || self.safety_horizon_min > self.prediction_horizon_min {
            return fail("safety_horizon_min must be >= 30 and <= prediction_horizon_min");
        }
        if self.prediction_horizon_min > 720 {
            return fail("prediction_horizon_min must be <= 720");
        }
        if self.carb_absorption_min < 30 || self.carb_absorption_min > 600 {
            return fail("carb_absorption_min must be within 30..=600");
        }
        if !finite_positive(self.max_carb_absorption_g_per_min) {
            return fail("max_carb_absorption_g_per_min must be > 0");
        }
        if self.autosens_window_hours == 0 || self.autosens_window_hours > 24 {
            return fail("autosens_window_hours must be within 1..=24");
        }
        if !(0.1..=1.0).contains(&self.autosens_min_ratio)
            || !(1.0..=3.0).contains(&self.autosens_max_ratio)
        {
            return fail("autosens ratio band must satisfy min in [0.1, 1] and max in [1, 3]");
        }
        if !(0.0..=1.0).contains(&self.micro_bolus_fraction) {
            return fail("micro_bolus_fraction must be within 0..=1");
        }
        if !self.min_bolus_glucose_mgdl.is_finite() || self.min_bolus_glucose_mgdl < self.hard_floor_mgdl {
            return fail("min_bolus_glucose_mgdl must be >= hard_floor_mgdl");
        }
        if let SmoothingKind::Exponential { alpha } = self.smoothing {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return fail("smoothing alpha must be within (0, 1]");
            }
        }
        if self.pump_family.is_empty() {
            return fail("pump_family must not be empty");
        }
        if !self.reservoir_veto_units.is_finite() || self.reservoir_veto_units < 0.0 {
            return fail("reservoir_veto_units must be >= 0");
        }
        Ok(())
    }

    /// Lookback needed by prediction and autosens (minutes).
    pub fn history_lookback_min(&self, insulin_action_min: u32) -> i64 {
        let carbs = (self.carb_absorption_min as f64 * 3.0) as i64;
        let autosens = i64::from(self.autosens_window_hours) * 60 + i64::from(insulin_action_min);
        i64::from(insulin_action_min).max(carbs).max(autosens)
    }
}

fn finite_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

// ---------------------------------------------------------------------------
// Shared snapshot
// ---------------------------------------------------------------------------

/// Live configuration shared between the runner and command handlers.
///
/// Readers take a whole snapshot with [`SharedConfig::snapshot`] at the
/// start of a cycle; an update swaps the pointer atomically so a cycle
/// never observes half of a change.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<LoopConfig>>,
}

impl SharedConfig {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<LoopConfig> {
        self.inner.load_full()
    }

    /// Validate and publish a new configuration.
    pub fn replace(&self, config: LoopConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        Ok(())
    }
}
