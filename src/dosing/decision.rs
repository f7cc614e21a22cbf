//! The validated, constrained outcome of one cycle's computation.

use serde::{Deserialize, Serialize};

use crate::constraints::{Quantity, Span};

/// Stage or strategy name as recorded in the audit log.
pub type SourceId = heapless::String<32>;

/// Short free-text reason as recorded in the audit log.
pub type ReasonText = heapless::String<64>;

/// What to do with the temp basal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasalDirective {
    /// Run a temp basal at `rate` U/h for `duration_min` minutes.
    Temp { rate: f64, duration_min: u32 },
    /// Scheduled basal: cancel any running temp basal, or leave the pump
    /// alone when none runs.
    Baseline,
}

/// What the strategy asked for before constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requested {
    pub strategy: SourceId,
    pub rate: f64,
    pub bolus: f64,
    pub reason: ReasonText,
}

/// Which edge of a bound a source set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    /// The source set one edge of the final bound.
    Edge { quantity: Quantity, edge: Edge, value: f64 },
    /// The requested value was moved to satisfy the bound or the pump step.
    Clamped { quantity: Quantity, from: f64, to: f64 },
    /// Empty intersection; the quantity fell back to its safe value.
    Infeasible { quantity: Quantity, min: f64, max: f64 },
    /// Hard veto; the whole decision fell back to baseline.
    Veto { reason: ReasonText },
    /// The strategy produced no usable recommendation.
    AlgorithmFallback { error: ReasonText },
}

/// One `(source, what it did)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleEntry {
    pub source: SourceId,
    pub applied: Applied,
}

impl RationaleEntry {
    pub fn new(source: &str, applied: Applied) -> Self {
        Self { source: crate::truncated(source), applied }
    }
}

/// Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingDecision {
    pub basal: BasalDirective,
    /// U, 0 for none
    pub bolus: f64,
    /// Scheduled basal at decision time (U/h)
    pub scheduled_basal: f64,
    pub requested: Option<Requested>,
    /// Final intersected temp-basal bound.
    pub basal_bound: Span,
    /// Final intersected bolus bound.
    pub bolus_bound: Span,
    pub rationale: Vec<RationaleEntry>,
}

impl DosingDecision {
    /// Rate the pump should deliver after this decision.
    pub fn effective_rate(&self) -> f64 {
        match self.basal {
            BasalDirective::Temp { rate, .. } => rate,
            BasalDirective::Baseline => self.scheduled_basal,
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.basal == BasalDirective::Baseline && self.bolus == 0.0
    }

    /// True when a hard veto or algorithm fallback produced this decision.
    pub fn is_fallback(&self) -> bool {
        self.rationale
            .iter()
            .any(|r| matches!(r.applied, Applied::Veto { .. } | Applied::AlgorithmFallback { .. }))
    }
}
