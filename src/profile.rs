//! Therapy profile: time-of-day slices of basal rate, sensitivity, carb
//! ratio and target range.
//!
//! A [`Profile`] can only be obtained through validation (directly or via
//! serde's `try_from`), so every live profile covers the whole day with
//! no gaps and no overlaps and carries sane insulin timing.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

pub const MINUTES_PER_DAY: u16 = 1440;

/// Therapy settings for one time-of-day range `[start_min, end_min)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileSlice {
    pub start_min: u16,
    pub end_min: u16,
    /// U/h
    pub basal_rate: f64,
    /// mg/dL per U
    pub isf: f64,
    /// g per U
    pub carb_ratio: f64,
    /// mg/dL
    pub target_low: f64,
    /// mg/dL
    pub target_high: f64,
}

impl ProfileSlice {
    pub fn target_mid(&self) -> f64 {
        (self.target_low + self.target_high) / 2.0
    }

    fn validate(&self) -> Result<(), ProfileError> {
        if self.start_min >= self.end_min || self.end_min > MINUTES_PER_DAY {
            return Err(ProfileError::Invalid("slice range must satisfy start < end <= 1440"));
        }
        if !self.basal_rate.is_finite() || self.basal_rate < 0.0 || self.basal_rate > 35.0 {
            return Err(ProfileError::Invalid("basal_rate must be within [0, 35]"));
        }
        if !self.isf.is_finite() || self.isf < 5.0 || self.isf > 1000.0 {
            return Err(ProfileError::Invalid("isf must be within [5, 1000]"));
        }
        if !self.carb_ratio.is_finite() || self.carb_ratio < 1.0 || self.carb_ratio > 200.0 {
            return Err(ProfileError::Invalid("carb_ratio must be within [1, 200]"));
        }
        if !(60.0..=300.0).contains(&self.target_low) || !(60.0..=300.0).contains(&self.target_high) {
            return Err(ProfileError::Invalid("targets must be within [60, 300]"));
        }
        if self.target_low > self.target_high {
            return Err(ProfileError::Invalid("target_low must not exceed target_high"));
        }
        Ok(())
    }
}

/// Unvalidated wire form of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub name: String,
    /// Fixed offset applied to UTC instants to find the time of day
    #[serde(default)]
    pub utc_offset_min: i32,
    /// Duration of insulin action (minutes)
    pub insulin_action_min: u32,
    /// Time of peak insulin activity (minutes)
    pub insulin_peak_min: u32,
    pub slices: Vec<ProfileSlice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProfileSpec", into = "ProfileSpec")]
pub struct Profile {
    name: String,
    utc_offset_min: i32,
    insulin_action_min: u32,
    insulin_peak_min: u32,
    slices: Vec<ProfileSlice>,
}

impl Profile {
    pub fn new(spec: ProfileSpec) -> Result<Self, ProfileError> {
        if spec.slices.is_empty() {
            return Err(ProfileError::Invalid("profile has no slices"));
        }
        if !(-14 * 60..=14 * 60).contains(&spec.utc_offset_min) {
            return Err(ProfileError::Invalid("utc_offset_min must be within ±14h"));
        }
        if !(120..=720).contains(&spec.insulin_action_min) {
            return Err(ProfileError::Invalid("insulin_action_min must be within 120..=720"));
        }
        if spec.insulin_peak_min < 20 || spec.insulin_peak_min * 2 >= spec.insulin_action_min {
            return Err(ProfileError::Invalid("insulin_peak_min must be >= 20 and < half the action time"));
        }

        let mut expected_start = 0;
        for slice in &spec.slices {
            slice.validate()?;
            if slice.start_min < expected_start {
                return Err(ProfileError::Invalid("slices overlap"));
            }
            if slice.start_min > expected_start {
                return Err(ProfileError::Invalid("gap between slices"));
            }
            expected_start = slice.end_min;
        }
        if expected_start != MINUTES_PER_DAY {
            return Err(ProfileError::Invalid("slices must cover the full day"));
        }

        Ok(Self {
            name: spec.name,
            utc_offset_min: spec.utc_offset_min,
            insulin_action_min: spec.insulin_action_min,
            insulin_peak_min: spec.insulin_peak_min,
            slices: spec.slices,
        })
    }

    /// Single-slice profile covering the whole day.
    pub fn flat(
        name: &str,
        basal_rate: f64,
        isf: f64,
        carb_ratio: f64,
        target: (f64, f64),
        insulin_action_min: u32,
        insulin_peak_min: u32,
    ) -> Result<Self, ProfileError> {
        Self::new(ProfileSpec {
            name: name.to_string(),
            utc_offset_min: 0,
            insulin_action_min,
            insulin_peak_min,
            slices: vec![ProfileSlice {
                start_min: 0,
                end_min: MINUTES_PER_DAY,
                basal_rate,
                isf,
                carb_ratio,
                target_low: target.0,
                target_high: target.1,
            }],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insulin_action_min(&self) -> u32 {
        self.insulin_action_min
    }

    pub fn insulin_peak_min(&self) -> u32 {
        self.insulin_peak_min
    }

    pub fn slices(&self) -> &[ProfileSlice] {
        &self.slices
    }

    /// Local minute-of-day (0..1440) for an instant.
    pub fn minute_of_day(&self, at: DateTime<Utc>) -> u16 {
        let local_secs = at.timestamp() + i64::from(self.utc_offset_min) * 60;
        (local_secs.rem_euclid(86_400) / 60) as u16
    }

    /// Slice in force at `at`.
    pub fn slice_at(&self, at: DateTime<Utc>) -> &ProfileSlice {
        let minute = self.minute_of_day(at);
        // Construction guarantees slices[0].start_min == 0 and contiguity,
        // so the partition point is always >= 1.
        let idx = self.slices.partition_point(|s| s.start_min <= minute).saturating_sub(1);
        &self.slices[idx]
    }

    pub fn basal_at(&self, at: DateTime<Utc>) -> f64 {
        self.slice_at(at).basal_rate
    }
}

impl TryFrom<ProfileSpec> for Profile {
    type Error = ProfileError;

    fn try_from(spec: ProfileSpec) -> Result<Self, Self::Error> {
        Self::new(spec)
    }
}

impl From<Profile> for ProfileSpec {
    fn from(p: Profile) -> Self {
        Self {
            name: p.name,
            utc_offset_min: p.utc_offset_min,
            insulin_action_min: p.insulin_action_min,
            insulin_peak_min: p.insulin_peak_min,
            slices: p.slices,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider port
// ---------------------------------------------------------------------------

/// Consumed profile interface.
pub trait ProfileProvider: Send + Sync {
    /// The profile in force at `now`, or a typed failure.
    fn current_profile(&self, now: DateTime<Utc>) -> Result<Arc<Profile>, ProfileError>;

    /// Activate a new, already validated profile.
    fn replace(&self, _profile: Profile) -> Result<(), ProfileError> {
        Err(ProfileError::ReadOnly)
    }
}

/// Provider holding one profile, swappable at runtime.
#[derive(Default)]
pub struct StaticProfileProvider {
    current: ArcSwapOption<Profile>,
}

impl StaticProfileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: Profile) -> Self {
        let p = Self::new();
        p.set(profile);
        p
    }

    pub fn set(&self, profile: Profile) {
        info!("profile: activated '{}' ({} slices)", profile.name(), profile.slices().len());
        self.current.store(Some(Arc::new(profile)));
    }

    pub fn clear(&self) {
        self.current.store(None);
    }
}

impl ProfileProvider for StaticProfileProvider {
    fn current_profile(&self, _now: DateTime<Utc>) -> Result<Arc<Profile>, ProfileError> {
        self.current.load_full().ok_or(ProfileError::NotConfigured)
    }

    fn replace(&self, profile: Profile) -> Result<(), ProfileError> {
        self.set(profile);
        Ok(())
    }
}
