//! Constraint chain.
//!
//! ```text
//!   RawRecommendation ──▶ [pump capability] ─▶ [user limits] ─▶ [derived] ──▶ DosingDecision
//!                              │                   │                │
//!                              └──── bounds ───────┴──── ∩ ─────────┘
//! ```
//!
//! Each provider contributes zero or more [`ConstraintBound`]s and may
//! veto.  Bounds for the same quantity are intersected (`min = max of mins`,
//! `max = min of maxes`), so a later stage can only narrow what an earlier
//! one allowed.  Intersection is associative and commutative: reordering
//! providers changes at most which source is blamed in the rationale,
//! never the numeric result.
//!
//! The chain is assembled once from an explicit [`ConstraintRegistry`];
//! providers are ordered by [`Priority`] with registration order kept
//! within a priority.

pub mod providers;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::LoopConfig;
use crate::dosing::{
    Applied, BasalDirective, DosingDecision, Edge, RationaleEntry, RawRecommendation, Requested,
};
use crate::error::{AlgorithmError, ConfigError};
use crate::pump::{PumpCapabilities, PumpStatus};

/// Source for rationale entries produced by pump step rounding.
pub const PUMP_STEP_SOURCE: &str = "pump_step";

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Temp basal rate (U/h)
    TempBasal,
    /// Bolus amount (U)
    Bolus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstraintBound {
    pub quantity: Quantity,
    pub min: f64,
    pub max: f64,
    pub source: &'static str,
}

impl ConstraintBound {
    pub fn between(quantity: Quantity, min: f64, max: f64, source: &'static str) -> Self {
        Self { quantity, min, max, source }
    }

    pub fn at_most(quantity: Quantity, max: f64, source: &'static str) -> Self {
        Self::between(quantity, f64::NEG_INFINITY, max, source)
    }
}

/// A numeric interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub min: f64,
    pub max: f64,
}

impl Span {
    pub fn contains(&self, v: f64) -> bool {
        self.min <= v && v <= self.max
    }
}

/// Running intersection for one quantity, with attribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedBound {
    pub min: f64,
    pub max: f64,
    /// First source that raised `min` to its final value.
    pub min_source: Option<&'static str>,
    /// First source that lowered `max` to its final value.
    pub max_source: Option<&'static str>,
}

impl Default for CombinedBound {
    fn default() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            min_source: None,
            max_source: None,
        }
    }
}

impl CombinedBound {
    pub fn intersect(&mut self, bound: &ConstraintBound) {
        if bound.min > self.min {
            self.min = bound.min;
            self.min_source = Some(bound.source);
        }
        if bound.max < self.max {
            self.max = bound.max;
            self.max_source = Some(bound.source);
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.min <= self.max
    }

    pub fn span(&self) -> Span {
        Span { min: self.min, max: self.max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Veto {
    pub source: &'static str,
    pub reason: &'static str,
}

/// What one provider adds in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contribution {
    pub bounds: Vec<ConstraintBound>,
    pub veto: Option<&'static str>,
}

impl Contribution {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bound(bound: ConstraintBound) -> Self {
        Self { bounds: vec![bound], veto: None }
    }

    pub fn with(mut self, bound: ConstraintBound) -> Self {
        self.bounds.push(bound);
        self
    }

    pub fn veto(reason: &'static str) -> Self {
        Self { bounds: Vec::new(), veto: Some(reason) }
    }
}

// ---------------------------------------------------------------------------
// Provider interface
// ---------------------------------------------------------------------------

/// Stage order.  Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    PumpCapability,
    UserLimit,
    Derived,
}

impl Priority {
    pub fn name(self) -> &'static str {
        match self {
            Self::PumpCapability => "pump_capability",
            Self::UserLimit => "user_limit",
            Self::Derived => "derived",
        }
    }
}

/// Per-cycle facts a provider may look at.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintContext<'a> {
    pub now: DateTime<Utc>,
    pub scheduled_basal: f64,
    pub glucose_mgdl: f64,
    /// Insulin on board now (U)
    pub iob: f64,
    /// Lowest forecast within the safety horizon (mg/dL)
    pub predicted_min: f64,
    /// Lower target of the profile slice in force (mg/dL)
    pub target_low: f64,
    pub pump: &'a PumpStatus,
    pub capabilities: &'a PumpCapabilities,
    pub config: &'a LoopConfig,
}

pub trait ConstraintProvider: Send + Sync {
    fn id(&self) -> &'static str;

    fn priority(&self) -> Priority;

    fn provide(&self, ctx: &ConstraintContext<'_>) -> Contribution;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit, statically assembled list of providers.
#[derive(Default)]
pub struct ConstraintRegistry {
    entries: Vec<Box<dyn ConstraintProvider>>,
}

/// Priorities a chain must cover before it may run.
const REQUIRED: [Priority; 2] = [Priority::PumpCapability, Priority::UserLimit];

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every provider shipped with the crate.
    pub fn standard() -> Self {
        use providers::*;
        let mut r = Self::new();
        r.register(PumpCapabilityLimits);
        r.register(ReservoirLevel);
        r.register(UserMaxBasal);
        r.register(UserMaxBolus);
        r.register(MaxIob);
        r.register(PredictedLow);
        r.register(LowGlucoseBolusBlock);
        r
    }

    pub fn register(&mut self, provider: impl ConstraintProvider + 'static) -> &mut Self {
        self.entries.push(Box::new(provider));
        self
    }

    pub fn register_boxed(&mut self, provider: Box<dyn ConstraintProvider>) -> &mut Self {
        self.entries.push(provider);
        self
    }

    /// Order providers and check that every required stage is present.
    pub fn build(self) -> Result<ConstraintChain, ConfigError> {
        for required in REQUIRED {
            if !self.entries.iter().any(|p| p.priority() == required) {
                error!("constraints: no provider for stage {}", required.name());
                return Err(ConfigError::MissingConstraint(required.name()));
            }
        }
        let mut stages = self.entries;
        // Stable: registration order survives within a priority.
        stages.sort_by_key(|p| p.priority());
        info!(
            "constraints: chain [{}]",
            stages.iter().map(|p| p.id()).collect::<Vec<_>>().join(", ")
        );
        Ok(ConstraintChain { stages })
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub basal: CombinedBound,
    pub bolus: CombinedBound,
    /// First veto raised, in stage order.
    pub veto: Option<Veto>,
}

pub struct ConstraintChain {
    stages: Vec<Box<dyn ConstraintProvider>>,
}

impl ConstraintChain {
    pub fn stage_ids(&self) -> Vec<&'static str> {
        self.stages.iter().map(|p| p.id()).collect()
    }

    /// Run every stage and intersect what they contribute.
    pub fn evaluate(&self, ctx: &ConstraintContext<'_>) -> Evaluation {
        let mut eval = Evaluation {
            basal: CombinedBound::default(),
            bolus: CombinedBound::default(),
            veto: None,
        };
        for stage in &self.stages {
            let contribution = stage.provide(ctx);
            for bound in &contribution.bounds {
                match bound.quantity {
                    Quantity::TempBasal => eval.basal.intersect(bound),
                    Quantity::Bolus => eval.bolus.intersect(bound),
                }
            }
            if let (None, Some(reason)) = (eval.veto, contribution.veto) {
                eval.veto = Some(Veto { source: stage.id(), reason });
            }
        }
        eval
    }

    /// Turn a (possibly failed) strategy output into a final decision.
    pub fn decide(
        &self,
        strategy: &'static str,
        raw: Result<RawRecommendation, AlgorithmError>,
        ctx: &ConstraintContext<'_>,
    ) -> DosingDecision {
        let eval = self.evaluate(ctx);
        let mut decision = DosingDecision {
            basal: BasalDirective::Baseline,
            bolus: 0.0,
            scheduled_basal: ctx.scheduled_basal,
            requested: None,
            basal_bound: eval.basal.span(),
            bolus_bound: eval.bolus.span(),
            rationale: Vec::new(),
        };

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                warn!("constraints: {strategy} failed ({e}), falling back to baseline");
                decision.rationale.push(RationaleEntry::new(
                    strategy,
                    Applied::AlgorithmFallback { error: crate::truncated(&e.to_string()) },
                ));
                return decision;
            }
        };
        decision.requested = Some(Requested {
            strategy: crate::truncated(strategy),
            rate: raw.temp_basal_rate,
            bolus: raw.bolus,
            reason: crate::truncated(raw.reason),
        });

        if let Some(veto) = eval.veto {
            error!("constraints: {} vetoed dosing: {}", veto.source, veto.reason);
            decision
                .rationale
                .push(RationaleEntry::new(veto.source, Applied::Veto { reason: crate::truncated(veto.reason) }));
            return decision;
        }

        let basal = settle(
            Quantity::TempBasal,
            raw.temp_basal_rate,
            &eval.basal,
            ctx.capabilities.basal_step,
            &mut decision.rationale,
        );
        decision.basal = match basal {
            Some(rate) => BasalDirective::Temp { rate, duration_min: ctx.config.temp_basal_duration_min },
            None => BasalDirective::Baseline,
        };

        if raw.bolus > 0.0 {
            decision.bolus = settle(
                Quantity::Bolus,
                raw.bolus,
                &eval.bolus,
                ctx.capabilities.bolus_step,
                &mut decision.rationale,
            )
            .unwrap_or(0.0);
        }
        decision
    }
}

/// Clamp `requested` into `bound` and round down to the pump step without
/// leaving the bound.  `None` when the bound is empty or holds no step.
fn settle(
    quantity: Quantity,
    requested: f64,
    bound: &CombinedBound,
    step: f64,
    rationale: &mut Vec<RationaleEntry>,
) -> Option<f64> {
    if !bound.is_feasible() {
        let blame = bound.min_source.or(bound.max_source).unwrap_or("chain");
        warn!(
            "constraints: {quantity:?} bound empty [{:.2}, {:.2}] ({} vs {})",
            bound.min,
            bound.max,
            bound.min_source.unwrap_or("-"),
            bound.max_source.unwrap_or("-")
        );
        rationale.push(RationaleEntry::new(blame, Applied::Infeasible { quantity, min: bound.min, max: bound.max }));
        return None;
    }

    if let Some(src) = bound.min_source {
        rationale.push(RationaleEntry::new(src, Applied::Edge { quantity, edge: Edge::Min, value: bound.min }));
    }
    if let Some(src) = bound.max_source {
        rationale.push(RationaleEntry::new(src, Applied::Edge { quantity, edge: Edge::Max, value: bound.max }));
    }

    let clamped = requested.clamp(bound.min, bound.max);
    if clamped != requested {
        let src = if requested > bound.max { bound.max_source } else { bound.min_source };
        rationale.push(RationaleEntry::new(
            src.unwrap_or("chain"),
            Applied::Clamped { quantity, from: requested, to: clamped },
        ));
    }

    let Some(stepped) = round_to_step(clamped, step, bound) else {
        rationale.push(RationaleEntry::new(
            PUMP_STEP_SOURCE,
            Applied::Infeasible { quantity, min: bound.min, max: bound.max },
        ));
        return None;
    };
    if stepped != clamped {
        rationale.push(RationaleEntry::new(PUMP_STEP_SOURCE, Applied::Clamped { quantity, from: clamped, to: stepped }));
    }
    Some(stepped)
}

fn round_to_step(value: f64, step: f64, bound: &CombinedBound) -> Option<f64> {
    const EPS: f64 = 1e-9;
    if step.is_nan() || step <= 0.0 {
        return Some(value);
    }
    let down = (value / step + EPS).floor() * step;
    let candidate = if down >= bound.min - EPS {
        down
    } else {
        let up = (bound.min / step - EPS).ceil() * step;
        if up > bound.max + EPS {
            return None;
        }
        up
    };
    // Guard against the epsilon pushing the candidate a hair outside.
    Some(candidate.clamp(bound.min, bound.max))
}
