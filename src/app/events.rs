//! Outbound loop events and the per-cycle audit record.
//!
//! The [`LoopService`](super::service::LoopService) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other side
//! decide what to do with them: log, show in a UI, upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dosing::{DosingDecision, RationaleEntry, ReasonText};
use crate::pump::ConfirmedCommand;

/// Why a cycle did nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LoopDisabled,
    NoGlucose,
    /// Newest reading older than the staleness threshold.
    StaleGlucose { age_secs: i64 },
    NoProfile,
    InvalidProfile { detail: ReasonText },
    /// Disconnected, and the one reconnection attempt failed.
    PumpDisconnected { detail: ReasonText },
    /// Cycle-level configuration problem, e.g. an incomplete constraint
    /// registry.
    Configuration { detail: ReasonText },
    /// Cancelled before any pump command was sent.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Every planned command was confirmed (possibly none).
    Committed { commands: Vec<ConfirmedCommand> },
    /// The dispatcher gave up.  `commands` holds what was confirmed before
    /// the failing command.
    Failed { reason: ReasonText, commands: Vec<ConfirmedCommand> },
    Skipped { reason: SkipReason },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Commands the pump confirmed during the cycle.
    pub fn confirmed(&self) -> &[ConfirmedCommand] {
        match self {
            Self::Committed { commands } | Self::Failed { commands, .. } => commands,
            Self::Skipped { .. } => &[],
        }
    }
}

/// Values the decision was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleInputs {
    pub glucose: f64,
    pub delta: f64,
    pub iob: f64,
    pub cob: f64,
    pub eventual: f64,
    pub predicted_min: f64,
    pub autosens_ratio: f64,
    /// ISF after sensitivity adjustment
    pub isf: f64,
}

/// One cycle, as stored in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopResult {
    pub sequence: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub decision: Option<DosingDecision>,
    pub inputs: Option<CycleInputs>,
}

impl LoopResult {
    pub fn rationale(&self) -> &[RationaleEntry] {
        self.decision.as_ref().map_or(&[], |d| d.rationale.as_slice())
    }
}

/// Structured events emitted by the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// The service is ready; carries the next cycle sequence number.
    Started { next_sequence: u64 },
    /// Emitted exactly once per cycle.
    CycleCompleted(Box<LoopResult>),
    ConfigUpdated,
    ProfileUpdated { name: ReasonText },
    EnabledChanged { enabled: bool },
    /// A command from outside was refused.
    CommandRejected { reason: ReasonText },
}
