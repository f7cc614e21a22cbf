//! Built-in constraint providers.
//!
//! | Provider                 | Stage           | Effect                                   |
//! |--------------------------|-----------------|------------------------------------------|
//! | `PumpCapabilityLimits`   | PumpCapability  | `[0, pump max]` for rate and bolus       |
//! | `ReservoirLevel`         | PumpCapability  | bolus ≤ reservoir, veto when near empty  |
//! | `UserMaxBasal`           | UserLimit       | rate ≤ min(absolute, multiplier × sched) |
//! | `UserMaxBolus`           | UserLimit       | bolus ≤ max bolus, 0 unless SMB enabled  |
//! | `MaxIob`                 | UserLimit       | bolus ≤ headroom, no high temp at max    |
//! | `PredictedLow`           | Derived         | no high temp or bolus below target       |
//! | `LowGlucoseBolusBlock`   | Derived         | no bolus under the bolus glucose floor   |

use super::{ConstraintBound, ConstraintContext, ConstraintProvider, Contribution, Priority, Quantity};

// ── Pump capability ─────────────────────────────────────────────

pub struct PumpCapabilityLimits;

impl ConstraintProvider for PumpCapabilityLimits {
    fn id(&self) -> &'static str {
        "pump_capability"
    }

    fn priority(&self) -> Priority {
        Priority::PumpCapability
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        let caps = ctx.capabilities;
        Contribution::bound(ConstraintBound::between(Quantity::TempBasal, 0.0, caps.max_basal_rate, self.id()))
            .with(ConstraintBound::between(Quantity::Bolus, 0.0, caps.max_bolus, self.id()))
    }
}

pub struct ReservoirLevel;

impl ConstraintProvider for ReservoirLevel {
    fn id(&self) -> &'static str {
        "reservoir"
    }

    fn priority(&self) -> Priority {
        Priority::PumpCapability
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        let reservoir = ctx.pump.reservoir_units;
        if !reservoir.is_finite() || reservoir < ctx.config.reservoir_veto_units {
            return Contribution::veto("reservoir nearly empty");
        }
        Contribution::bound(ConstraintBound::at_most(Quantity::Bolus, reservoir, self.id()))
    }
}

// ── User limits ─────────────────────────────────────────────────

pub struct UserMaxBasal;

impl ConstraintProvider for UserMaxBasal {
    fn id(&self) -> &'static str {
        "user_max_basal"
    }

    fn priority(&self) -> Priority {
        Priority::UserLimit
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        let cfg = ctx.config;
        let max = cfg.max_basal_rate.min(ctx.scheduled_basal * cfg.max_basal_multiplier);
        Contribution::bound(ConstraintBound::at_most(Quantity::TempBasal, max, self.id()))
    }
}

pub struct UserMaxBolus;

impl ConstraintProvider for UserMaxBolus {
    fn id(&self) -> &'static str {
        "user_max_bolus"
    }

    fn priority(&self) -> Priority {
        Priority::UserLimit
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        let max = if ctx.config.micro_bolus_enabled { ctx.config.max_bolus } else { 0.0 };
        Contribution::bound(ConstraintBound::at_most(Quantity::Bolus, max, self.id()))
    }
}

pub struct MaxIob;

impl ConstraintProvider for MaxIob {
    fn id(&self) -> &'static str {
        "max_iob"
    }

    fn priority(&self) -> Priority {
        Priority::UserLimit
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        let headroom = (ctx.config.max_iob - ctx.iob).max(0.0);
        let c = Contribution::bound(ConstraintBound::at_most(Quantity::Bolus, headroom, self.id()));
        if ctx.iob >= ctx.config.max_iob {
            // At the ceiling: nothing above scheduled basal.
            return c.with(ConstraintBound::at_most(Quantity::TempBasal, ctx.scheduled_basal, self.id()));
        }
        c
    }
}

// ── Derived ─────────────────────────────────────────────────────

pub struct PredictedLow;

impl ConstraintProvider for PredictedLow {
    fn id(&self) -> &'static str {
        "predicted_low"
    }

    fn priority(&self) -> Priority {
        Priority::Derived
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        if ctx.predicted_min >= ctx.target_low {
            return Contribution::none();
        }
        Contribution::bound(ConstraintBound::at_most(Quantity::TempBasal, ctx.scheduled_basal, self.id()))
            .with(ConstraintBound::between(Quantity::Bolus, 0.0, 0.0, self.id()))
    }
}

pub struct LowGlucoseBolusBlock;

impl ConstraintProvider for LowGlucoseBolusBlock {
    fn id(&self) -> &'static str {
        "low_glucose_bolus_block"
    }

    fn priority(&self) -> Priority {
        Priority::Derived
    }

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution {
        if ctx.glucose_mgdl < ctx.config.min_bolus_glucose_mgdl {
            Contribution::bound(ConstraintBound::between(Quantity::Bolus, 0.0, 0.0, self.id()))
        } else {
            Contribution::none()
        }
    }
}
