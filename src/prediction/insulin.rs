//! Exponential insulin action curve and insulin-on-board accounting.
//!
//! The curve is parameterised by the duration of insulin action `td` and
//! the time of peak activity `tp` (both minutes):
//!
//! ```text
//! tau = tp (1 - tp/td) / (1 - 2 tp/td)
//! a   = 2 tau / td
//! S   = 1 / (1 - a + (1 + a) e^(-td/tau))
//!
//! activity(t)  = S / tau² · t (1 - t/td) e^(-t/tau)
//! remaining(t) = 1 - S (1 - a) ((t² / (tau td (1 - a)) - t/tau - 1) e^(-t/tau) + 1)
//! ```
//!
//! `remaining` is pinned to 1 before the dose and to exactly 0 from `td`
//! on, and clamped to `[0, 1]` in between.

use chrono::{DateTime, Duration, Utc};

use crate::error::ProfileError;
use crate::history::Treatment;
use crate::profile::Profile;

/// Temp basal delivery is modelled as one pulse per this many minutes.
pub const PULSE_MIN: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsulinCurve {
    td: f64,
    tau: f64,
    a: f64,
    s: f64,
}

impl InsulinCurve {
    pub fn new(action_min: u32, peak_min: u32) -> Result<Self, ProfileError> {
        let td = f64::from(action_min);
        let tp = f64::from(peak_min);
        if !(tp > 0.0 && tp < td / 2.0) {
            return Err(ProfileError::Invalid("insulin peak must lie in (0, action/2)"));
        }
        let tau = tp * (1.0 - tp / td) / (1.0 - 2.0 * tp / td);
        let a = 2.0 * tau / td;
        let s = 1.0 / (1.0 - a + (1.0 + a) * (-td / tau).exp());
        Ok(Self { td, tau, a, s })
    }

    pub fn for_profile(profile: &Profile) -> Result<Self, ProfileError> {
        Self::new(profile.insulin_action_min(), profile.insulin_peak_min())
    }

    pub fn action_min(&self) -> f64 {
        self.td
    }

    /// Fraction of a dose still on board `t` minutes after delivery.
    pub fn remaining(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 1.0;
        }
        if t >= self.td {
            return 0.0;
        }
        let Self { td, tau, a, s } = *self;
        let inner = (t * t / (tau * td * (1.0 - a)) - t / tau - 1.0) * (-t / tau).exp() + 1.0;
        (1.0 - s * (1.0 - a) * inner).clamp(0.0, 1.0)
    }

    /// Fraction of a dose absorbed per minute, `t` minutes after delivery.
    pub fn activity(&self, t: f64) -> f64 {
        if t <= 0.0 || t >= self.td {
            return 0.0;
        }
        let Self { td, tau, s, .. } = *self;
        (s / (tau * tau) * t * (1.0 - t / td) * (-t / tau).exp()).max(0.0)
    }
}

/// A discrete amount of insulin delivered at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsulinDose {
    pub timestamp: DateTime<Utc>,
    pub units: f64,
}

/// Flatten treatments into discrete doses delivered up to `now`.
///
/// Boluses map one-to-one.  A temp basal contributes only what it
/// delivers above the scheduled basal, split into [`PULSE_MIN`] pulses.
/// It ends at its programmed duration, at the next temp basal start or
/// cancel, or at `now`, whichever comes first.  Treatments after `now`
/// are ignored.
pub fn insulin_doses(treatments: &[Treatment], profile: &Profile, now: DateTime<Utc>) -> Vec<InsulinDose> {
    let mut doses = Vec::new();
    for (idx, treatment) in treatments.iter().enumerate() {
        match *treatment {
            Treatment::Bolus { amount, timestamp } if timestamp <= now => {
                doses.push(InsulinDose { timestamp, units: amount });
            }
            Treatment::TempBasalStart { rate, duration_min, timestamp } if timestamp <= now => {
                let programmed_end = timestamp + Duration::minutes(i64::from(duration_min));
                let superseded = treatments[idx + 1..]
                    .iter()
                    .find(|t| matches!(t, Treatment::TempBasalStart { .. } | Treatment::TempBasalCancel { .. }))
                    .map(Treatment::timestamp);
                let mut end = programmed_end.min(now);
                if let Some(at) = superseded {
                    end = end.min(at);
                }
                push_temp_pulses(&mut doses, rate, timestamp, end, profile);
            }
            _ => {}
        }
    }
    doses
}

fn push_temp_pulses(
    doses: &mut Vec<InsulinDose>,
    rate: f64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    profile: &Profile,
) {
    let mut chunk_start = start;
    while chunk_start < end {
        let chunk_end = (chunk_start + Duration::minutes(PULSE_MIN)).min(end);
        let minutes = (chunk_end - chunk_start).num_milliseconds() as f64 / 60_000.0;
        let excess = (rate - profile.basal_at(chunk_start)).max(0.0);
        let units = excess * minutes / 60.0;
        if units > 0.0 {
            doses.push(InsulinDose { timestamp: chunk_start, units });
        }
        chunk_start = chunk_end;
    }
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Insulin on board at `at`.
pub fn iob_at(doses: &[InsulinDose], curve: &InsulinCurve, at: DateTime<Utc>) -> f64 {
    doses
        .iter()
        .map(|d| d.units * curve.remaining(minutes_between(d.timestamp, at)))
        .sum::<f64>()
        .max(0.0)
}

/// Insulin absorbed per minute at `at` (U/min).
pub fn activity_at(doses: &[InsulinDose], curve: &InsulinCurve, at: DateTime<Utc>) -> f64 {
    doses
        .iter()
        .map(|d| d.units * curve.activity(minutes_between(d.timestamp, at)))
        .sum()
}
