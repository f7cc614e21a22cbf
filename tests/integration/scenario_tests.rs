//! End-to-end cycles through the full pipeline:
//! history → prediction → dosing → constraint chain → dispatcher → pump.

use aidloop::app::events::{CycleOutcome, SkipReason};
use aidloop::app::ports::TimePort;
use aidloop::config::LoopConfig;
use aidloop::dosing::BasalDirective;
use aidloop::error::DriverError;
use aidloop::history::{GlucoseReading, HistoryStore, Treatment, TrendDirection};
use aidloop::prediction::InsulinCurve;
use aidloop::pump::{ConnectionState, FaultKind, PumpOp};
use chrono::Duration;

use crate::mock_pump::{Harness, PumpCall, t0};

// ── Bolus an hour ago, glucose in range: nothing to do ────────

#[test]
fn recent_bolus_in_range_commits_without_pump_calls() {
    let mut h = Harness::new(LoopConfig::default());
    h.history
        .append_treatment(Treatment::Bolus { amount: 2.0, timestamp: t0() - Duration::minutes(60) })
        .unwrap();
    h.flat_glucose(180.0);

    let result = h.cycle();

    let inputs = result.inputs.expect("cycle computed");
    let expected_iob = 2.0 * InsulinCurve::new(180, 75).unwrap().remaining(60.0);
    assert!((inputs.iob - expected_iob).abs() < 1e-9, "iob {} vs {expected_iob}", inputs.iob);
    assert!((90.0..=180.0).contains(&inputs.eventual), "eventual {}", inputs.eventual);

    let decision = result.decision.expect("decision recorded");
    assert!((decision.effective_rate() - 1.0).abs() < 1e-9, "rate should stay at scheduled basal");
    assert_eq!(decision.bolus, 0.0);

    assert_eq!(result.outcome, CycleOutcome::Committed { commands: vec![] });
    assert!(h.pump.calls().is_empty(), "no delta means no pump traffic, got {:?}", h.pump.calls());
}

// ── Just under target and falling: suspend ────────────────────

#[test]
fn falling_below_target_suspends_and_chain_keeps_zero() {
    let mut h = Harness::new(LoopConfig::default());
    // 101 → 89 in 2 mg/dL steps, newest is target_low - 1.
    h.glucose_series(7, 0, |i| 101.0 - 2.0 * f64::from(i));

    let result = h.cycle();
    let decision = result.decision.expect("decision recorded");

    let requested = decision.requested.as_ref().expect("strategy ran");
    assert_eq!(requested.rate, 0.0);
    assert_eq!(requested.bolus, 0.0);

    match decision.basal {
        BasalDirective::Temp { rate, duration_min } => {
            assert_eq!(rate, 0.0, "constraints must not raise a suspend");
            assert_eq!(duration_min, 30);
        }
        BasalDirective::Baseline => panic!("expected a zero temp basal, got baseline"),
    }
    assert_eq!(decision.bolus, 0.0);
    assert!(decision.basal_bound.contains(0.0));

    assert_eq!(h.pump.command_calls(), vec![PumpCall::SetTempBasal { rate: 0.0, duration_min: 30 }]);
    assert!(matches!(result.outcome, CycleOutcome::Committed { ref commands } if commands.len() == 1));
}

// ── Two timeouts, third attempt succeeds ──────────────────────

#[test]
fn temp_basal_succeeds_on_third_attempt() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    h.pump.inject(PumpOp::SetTempBasal, FaultKind::Fail(DriverError::Timeout));
    h.pump.inject(PumpOp::SetTempBasal, FaultKind::Fail(DriverError::Timeout));

    let result = h.cycle();

    let calls = h.pump.calls();
    assert_eq!(calls.len(), 3, "exactly three driver calls, got {calls:?}");
    assert!(calls.iter().all(|c| matches!(c, PumpCall::SetTempBasal { .. })));
    assert!(matches!(result.outcome, CycleOutcome::Committed { ref commands } if commands.len() == 1));
    assert_eq!(h.delay.total(), std::time::Duration::from_millis(500 + 1000));

    let decision = result.decision.unwrap();
    let rate = decision.effective_rate();
    assert!(rate > 1.0, "high glucose should raise the rate, got {rate}");
    assert!(decision.basal_bound.contains(rate));
}

// ── Staleness boundaries ──────────────────────────────────────

fn run_with_age(age_secs: i64) -> (CycleOutcome, Vec<PumpCall>) {
    let config = LoopConfig::default();
    let mut h = Harness::new(config);
    // Disconnected so that any pump interaction at all would be recorded.
    h.pump.set_connection(ConnectionState::Disconnected);
    h.glucose_series(7, age_secs, |_| 120.0);
    let result = h.cycle();
    (result.outcome, h.pump.calls())
}

#[test]
fn staleness_threshold_boundaries() {
    let threshold = i64::from(LoopConfig::default().glucose_staleness_secs);

    let (outcome, _) = run_with_age(threshold - 1);
    assert!(!matches!(outcome, CycleOutcome::Skipped { .. }), "one second fresh: {outcome:?}");

    let (outcome, _) = run_with_age(threshold);
    assert!(!matches!(outcome, CycleOutcome::Skipped { .. }), "exactly at threshold: {outcome:?}");

    let (outcome, calls) = run_with_age(threshold + 1);
    assert_eq!(outcome, CycleOutcome::Skipped { reason: SkipReason::StaleGlucose { age_secs: threshold + 1 } });
    assert!(calls.is_empty(), "stale cycle touched the pump: {calls:?}");
}

#[test]
fn fraction_of_a_second_past_threshold_is_stale() {
    let threshold = i64::from(LoopConfig::default().glucose_staleness_secs);
    let mut h = Harness::new(LoopConfig::default());
    let newest = h.clock.now() - Duration::seconds(threshold) - Duration::milliseconds(900);
    for i in (0..7).rev() {
        let at = newest - Duration::minutes(5 * i);
        h.history.append_glucose(GlucoseReading::new(at, 120.0, TrendDirection::Flat, "test")).unwrap();
    }

    let result = h.cycle();
    assert_eq!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::StaleGlucose { age_secs: threshold } });
    assert!(h.pump.calls().is_empty());
}

#[test]
fn very_old_glucose_skips_with_zero_pump_calls() {
    let mut h = Harness::new(LoopConfig::default());
    h.glucose_series(7, 3600, |_| 300.0);
    let result = h.cycle();
    assert!(matches!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::StaleGlucose { .. } }));
    assert!(result.decision.is_none());
    assert!(h.pump.calls().is_empty());
}
