//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing every [`LoopEvent`] as one
//! structured log line.  A UI or upload adapter would implement the same
//! trait.

use log::{info, warn};

use crate::app::events::{CycleOutcome, LoopEvent};
use crate::app::ports::EventSink;
use crate::dosing::BasalDirective;

/// Adapter that logs every [`LoopEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::CycleCompleted(result) => {
                let basal = match result.decision.as_ref().map(|d| d.basal) {
                    Some(BasalDirective::Temp { rate, duration_min }) => format!("{rate:.2}U/h×{duration_min}m"),
                    Some(BasalDirective::Baseline) => "baseline".to_string(),
                    None => "-".to_string(),
                };
                let bolus = result.decision.as_ref().map_or(0.0, |d| d.bolus);
                let (bg, iob, eventual) =
                    result.inputs.map_or((f64::NAN, f64::NAN, f64::NAN), |i| (i.glucose, i.iob, i.eventual));
                let line = format!(
                    "CYCLE | #{} {} | bg={:.0} iob={:.2} eventual={:.0} | basal={} bolus={:.2} | rationale={}",
                    result.sequence,
                    result.outcome.label(),
                    bg,
                    iob,
                    eventual,
                    basal,
                    bolus,
                    result.rationale().len(),
                );
                match &result.outcome {
                    CycleOutcome::Committed { .. } => info!("{line}"),
                    CycleOutcome::Failed { reason, .. } => warn!("{line} | reason={reason}"),
                    CycleOutcome::Skipped { reason } => warn!("{line} | reason={reason:?}"),
                }
            }
            LoopEvent::Started { next_sequence } => {
                info!("START | next_cycle={next_sequence}");
            }
            LoopEvent::ConfigUpdated => {
                info!("CONFIG | updated");
            }
            LoopEvent::ProfileUpdated { name } => {
                info!("PROFILE | active={name}");
            }
            LoopEvent::EnabledChanged { enabled } => {
                info!("LOOP | enabled={enabled}");
            }
            LoopEvent::CommandRejected { reason } => {
                warn!("COMMAND | rejected: {reason}");
            }
        }
    }
}
